use std::time::Duration;

/// The in-process configuration surface the dispatcher and transports are built from. This
/// crate does not parse TOML, env vars, or flags — an embedding application is expected to
/// populate this struct however it likes and hand it to [`crate::dispatcher::Dispatcher`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The service interface this dispatcher speaks to, used in log lines and error text.
    pub service: String,
    /// Applied when a call doesn't specify its own timeout.
    pub default_timeout: Duration,
    /// Stamped on every outbound call's context, see `sinks::client_id`.
    pub client_id: Option<String>,
    /// Free-form selector an embedding application uses to pick a protocol/codec factory;
    /// this crate does not interpret the value.
    pub protocol: Option<String>,
}

impl ClientConfig {
    pub fn new(service: impl Into<String>, default_timeout: Duration) -> Self {
        Self {
            service: service.into(),
            default_timeout,
            client_id: None,
            protocol: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }
}
