use crate::error::StoreError;
use crate::queue::QueueRecord;

/// A feedback record as it sits in the durable feedback queue: the gateway's
/// report timestamp plus the device token text in whatever format the relay
/// is configured to emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackItem {
    pub timestamp: String,
    pub device_token_text: String,
}

impl QueueRecord for FeedbackItem {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.timestamp.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.timestamp.as_bytes());
        buf.extend_from_slice(&(self.device_token_text.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.device_token_text.as_bytes());
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() < 2 {
            return Err(corrupt("row too short for timestamp length".to_string()));
        }
        let ts_len = u16::from_be_bytes(bytes[0..2].try_into().unwrap()) as usize;
        let ts_at = 2;
        if bytes.len() < ts_at + ts_len + 2 {
            return Err(corrupt("row truncated after timestamp".to_string()));
        }
        let timestamp = String::from_utf8(bytes[ts_at..ts_at + ts_len].to_vec())
            .map_err(|_| corrupt("timestamp is not valid utf8".to_string()))?;

        let tok_len_at = ts_at + ts_len;
        let tok_len = u16::from_be_bytes(bytes[tok_len_at..tok_len_at + 2].try_into().unwrap()) as usize;
        let tok_at = tok_len_at + 2;
        if bytes.len() < tok_at + tok_len {
            return Err(corrupt("row truncated after token length".to_string()));
        }
        let device_token_text = String::from_utf8(bytes[tok_at..tok_at + tok_len].to_vec())
            .map_err(|_| corrupt("device token text is not valid utf8".to_string()))?;

        Ok(Self { timestamp, device_token_text })
    }
}

fn corrupt(reason: String) -> StoreError {
    StoreError::CorruptRow { table: "feedback", rowid: -1, reason }
}
