use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::queue::QueueRecord;
use crate::token::{DeviceToken, DEVICE_TOKEN_LEN};

pub const MAX_PAYLOAD_LEN: usize = 256;

/// Renders a seconds-since-epoch value as RFC3339 for log lines; falls back
/// to the raw integer for values outside `chrono`'s representable range
/// (malformed or adversarial `expiry_at` input should never panic a logger).
pub fn humanize_epoch(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| format!("<unrepresentable:{secs}>"))
}

/// A notification request as it sits in the durable push queue, from
/// acceptance on the control socket until the push agent either delivers or
/// discards it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: u32,
    pub created_at: i64,
    pub expiry_at: i64,
    pub device_token: DeviceToken,
    pub payload: Vec<u8>,
}

impl QueueRecord for Notification {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 8 + 8 + DEVICE_TOKEN_LEN + 2 + self.payload.len());
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&self.created_at.to_be_bytes());
        buf.extend_from_slice(&self.expiry_at.to_be_bytes());
        buf.extend_from_slice(&self.device_token.0);
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let min = 4 + 8 + 8 + DEVICE_TOKEN_LEN + 2;
        if bytes.len() < min {
            return Err(corrupt(format!("row too short: {} < {min}", bytes.len())));
        }
        let id = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let created_at = i64::from_be_bytes(bytes[4..12].try_into().unwrap());
        let expiry_at = i64::from_be_bytes(bytes[12..20].try_into().unwrap());
        let mut token = [0u8; DEVICE_TOKEN_LEN];
        token.copy_from_slice(&bytes[20..20 + DEVICE_TOKEN_LEN]);
        let payload_len_at = 20 + DEVICE_TOKEN_LEN;
        let payload_len = u16::from_be_bytes(bytes[payload_len_at..payload_len_at + 2].try_into().unwrap()) as usize;
        let payload_at = payload_len_at + 2;
        if bytes.len() < payload_at + payload_len {
            return Err(corrupt("payload length exceeds row".to_string()));
        }
        let payload = bytes[payload_at..payload_at + payload_len].to_vec();
        Ok(Self { id, created_at, expiry_at, device_token: DeviceToken(token), payload })
    }
}

fn corrupt(reason: String) -> StoreError {
    StoreError::CorruptRow { table: "notifications", rowid: -1, reason }
}
