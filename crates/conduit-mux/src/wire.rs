use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use conduit_core::message::{CallContext, Tag};

/// Subset of the wire's message-type tags this transport speaks. The one-byte code is the
/// frame's signed `msg_type`; negative values mark replies, positive values mark requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Tdispatch,
    Rdispatch,
    Tping,
    Rping,
    Tdiscarded,
    Rerr,
    BadRerr,
}

impl MessageType {
    pub fn code(self) -> i8 {
        match self {
            MessageType::Tdispatch => 2,
            MessageType::Rdispatch => -2,
            MessageType::Tping => 65,
            MessageType::Rping => -65,
            MessageType::Tdiscarded => 66,
            MessageType::Rerr => -128,
            MessageType::BadRerr => 127,
        }
    }

    pub fn from_code(code: i8) -> Option<Self> {
        match code {
            2 => Some(MessageType::Tdispatch),
            -2 => Some(MessageType::Rdispatch),
            65 => Some(MessageType::Tping),
            -65 => Some(MessageType::Rping),
            66 => Some(MessageType::Tdiscarded),
            -128 => Some(MessageType::Rerr),
            127 => Some(MessageType::BadRerr),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame header truncated")]
    Truncated,
    #[error("unrecognized message type code {0}")]
    UnknownType(i8),
    #[error("frame exceeds maximum length")]
    TooLarge,
}

pub const MAX_FRAME_BODY_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: MessageType,
    pub tag: Tag,
}

/// Header size in bytes: `type: i8` + `tag: u24`. Does not include the 4-byte length prefix,
/// which is read separately by the transport's receive loop.
pub const HEADER_LEN: usize = 4;

pub fn decode_header(buf: &[u8]) -> Result<FrameHeader, FrameError> {
    if buf.len() < HEADER_LEN {
        return Err(FrameError::Truncated);
    }
    let code = buf[0] as i8;
    let msg_type = MessageType::from_code(code).ok_or(FrameError::UnknownType(code))?;
    let tag = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]);
    Ok(FrameHeader {
        msg_type,
        tag: Tag(tag),
    })
}

/// Encodes a full frame: `[u32 length][i8 type][u24 tag][body]`. `length` covers everything
/// after itself.
pub fn encode_frame(msg_type: MessageType, tag: Tag, body: &[u8]) -> Result<Bytes, FrameError> {
    if body.len() as u64 > MAX_FRAME_BODY_LEN as u64 {
        return Err(FrameError::TooLarge);
    }
    let total = HEADER_LEN + body.len();
    let mut out = BytesMut::with_capacity(4 + total);
    out.extend_from_slice(&(total as u32).to_be_bytes());
    out.extend_from_slice(&[msg_type.code() as u8]);
    let tag_bytes = tag.0.to_be_bytes();
    out.extend_from_slice(&tag_bytes[1..4]);
    out.extend_from_slice(body);
    Ok(out.freeze())
}

const DEADLINE_CONTEXT_KEY: &str = "Deadline";

const RSTATUS_OK: i8 = 0;
const RSTATUS_ERROR: i8 = 1;
const RSTATUS_NACK: i8 = 2;

/// Builds a `Tdispatch` body: the context list (including a `"Deadline"` entry when the call
/// carries one), `dst_len`/`dtab_len` (both unsupported, always zero), then the codec payload.
pub fn encode_tdispatch_body(payload: &[u8], context: &CallContext) -> Bytes {
    let deadline_value = context.deadline.map(|deadline| {
        let timestamp_us = deadline
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as i64;
        let timeout_us = context
            .remaining(SystemTime::now())
            .unwrap_or_default()
            .as_micros() as i64;
        let mut value = Vec::with_capacity(16);
        value.extend_from_slice(&timestamp_us.to_be_bytes());
        value.extend_from_slice(&timeout_us.to_be_bytes());
        value
    });

    let entry_count: i16 = if deadline_value.is_some() { 1 } else { 0 };
    let mut out = BytesMut::new();
    out.extend_from_slice(&entry_count.to_be_bytes());
    if let Some(value) = deadline_value {
        out.extend_from_slice(&(DEADLINE_CONTEXT_KEY.len() as i16).to_be_bytes());
        out.extend_from_slice(DEADLINE_CONTEXT_KEY.as_bytes());
        out.extend_from_slice(&(value.len() as i16).to_be_bytes());
        out.extend_from_slice(&value);
    }
    out.extend_from_slice(&0i16.to_be_bytes()); // dst_len, unsupported
    out.extend_from_slice(&0i16.to_be_bytes()); // dtab_len, unsupported
    out.extend_from_slice(payload);
    out.freeze()
}

/// The decoded shape of an `Rdispatch` body once its `status` byte and context list have been
/// stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RdispatchOutcome {
    Ok(Bytes),
    Error(String),
    Nack,
}

fn read_i16(buf: &[u8], pos: &mut usize) -> Result<i16, FrameError> {
    let slice = buf.get(*pos..*pos + 2).ok_or(FrameError::Truncated)?;
    *pos += 2;
    Ok(i16::from_be_bytes([slice[0], slice[1]]))
}

/// Parses an `Rdispatch` body: `status: int8` + `context_count: int16` + that many
/// `{key_len, key, value_len, value}` context entries (skipped, not interpreted) + payload.
pub fn parse_rdispatch_body(body: &[u8]) -> Result<RdispatchOutcome, FrameError> {
    let mut pos = 0usize;
    let status = *body.first().ok_or(FrameError::Truncated)? as i8;
    pos += 1;

    let context_count = read_i16(body, &mut pos)?;
    for _ in 0..context_count {
        let key_len = read_i16(body, &mut pos)?.max(0) as usize;
        pos += key_len;
        if pos > body.len() {
            return Err(FrameError::Truncated);
        }
        let value_len = read_i16(body, &mut pos)?.max(0) as usize;
        pos += value_len;
        if pos > body.len() {
            return Err(FrameError::Truncated);
        }
    }

    let rest = body.get(pos..).ok_or(FrameError::Truncated)?;
    match status {
        RSTATUS_OK => Ok(RdispatchOutcome::Ok(Bytes::copy_from_slice(rest))),
        RSTATUS_NACK => Ok(RdispatchOutcome::Nack),
        RSTATUS_ERROR => Ok(RdispatchOutcome::Error(
            String::from_utf8_lossy(rest).into_owned(),
        )),
        other => Ok(RdispatchOutcome::Error(format!(
            "unrecognized Rdispatch status {other}: {}",
            String::from_utf8_lossy(rest)
        ))),
    }
}
