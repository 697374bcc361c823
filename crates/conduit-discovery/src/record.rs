use std::collections::HashMap;

use serde::Deserialize;

/// A `host:port` pair, as carried in a coordination-store child node's JSON payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// An endpoint identified by its primary `(host, port)` plus zero or more named additional
/// endpoints, a status string, and an optional shard. Equality is structural across every
/// field, matching the coordination store's node data byte-for-byte semantics.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRecord {
    pub service_endpoint: Endpoint,
    #[serde(default)]
    pub additional_endpoints: HashMap<String, Endpoint>,
    pub status: String,
    #[serde(default)]
    pub shard: Option<i64>,
}

impl MemberRecord {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
