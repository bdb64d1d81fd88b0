//! Binary framing for the push gateway's extended-notification, error and
//! feedback formats.

use crate::error::WireError;
use crate::token::DEVICE_TOKEN_LEN;

pub const EXTENDED_NOTIFICATION_COMMAND: u8 = 1;
pub const ERROR_FRAME_LEN: usize = 6;
pub const FEEDBACK_TUPLE_LEN: usize = 4 + 2 + DEVICE_TOKEN_LEN;
pub const INVALID_TOKEN_STATUS: u8 = 8;
pub const ERROR_RESPONSE_COMMAND: u8 = 8;

/// `command:u8=1 || id:u32-be || expiry:u32-be || token_len:u16-be=32 ||
/// token:32B || payload_len:u16-be || payload`.
pub fn encode_notification_frame(id: u32, expiry: u32, token: &[u8; DEVICE_TOKEN_LEN], payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 4 + 4 + 2 + DEVICE_TOKEN_LEN + 2 + payload.len());
    buf.push(EXTENDED_NOTIFICATION_COMMAND);
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&expiry.to_be_bytes());
    buf.extend_from_slice(&(DEVICE_TOKEN_LEN as u16).to_be_bytes());
    buf.extend_from_slice(token);
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decodes a frame built by [`encode_notification_frame`]. The gateway never
/// echoes this frame back to us; this exists for tests and for the
/// round-trip property the wire format promises.
pub fn decode_notification_frame(buf: &[u8]) -> Result<(u32, u32, [u8; DEVICE_TOKEN_LEN], Vec<u8>), WireError> {
    let min = 1 + 4 + 4 + 2 + DEVICE_TOKEN_LEN + 2;
    if buf.len() < min {
        return Err(WireError::TooShort { got: buf.len(), need: min });
    }
    let command = buf[0];
    if command != EXTENDED_NOTIFICATION_COMMAND {
        return Err(WireError::UnknownCommand(command));
    }
    let id = u32::from_be_bytes(buf[1..5].try_into().unwrap());
    let expiry = u32::from_be_bytes(buf[5..9].try_into().unwrap());
    let token_len = u16::from_be_bytes(buf[9..11].try_into().unwrap()) as usize;
    if token_len != DEVICE_TOKEN_LEN {
        return Err(WireError::TooShort { got: token_len, need: DEVICE_TOKEN_LEN });
    }
    let token_start = 11;
    let token_end = token_start + DEVICE_TOKEN_LEN;
    let mut token = [0u8; DEVICE_TOKEN_LEN];
    token.copy_from_slice(&buf[token_start..token_end]);
    let payload_len = u16::from_be_bytes(buf[token_end..token_end + 2].try_into().unwrap()) as usize;
    let payload_start = token_end + 2;
    if buf.len() < payload_start + payload_len {
        return Err(WireError::TooShort { got: buf.len(), need: payload_start + payload_len });
    }
    let payload = buf[payload_start..payload_start + payload_len].to_vec();
    Ok((id, expiry, token, payload))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorFrame {
    pub status: u8,
    pub id: u32,
}

/// `command:u8=8 || status:u8 || id:u32-be`.
pub fn decode_error_frame(buf: &[u8]) -> Result<ErrorFrame, WireError> {
    if buf.len() != ERROR_FRAME_LEN {
        return Err(WireError::TooShort { got: buf.len(), need: ERROR_FRAME_LEN });
    }
    let command = buf[0];
    if command != ERROR_RESPONSE_COMMAND {
        return Err(WireError::UnknownCommand(command));
    }
    let status = buf[1];
    let id = u32::from_be_bytes(buf[2..6].try_into().unwrap());
    Ok(ErrorFrame { status, id })
}

pub fn status_reason(status: u8) -> &'static str {
    match status {
        0 => "no error encountered",
        1 => "processing error",
        2 => "missing device token",
        3 => "missing topic",
        4 => "missing payload",
        5 => "invalid token size",
        6 => "invalid topic size",
        7 => "invalid payload size",
        8 => "invalid token",
        _ => "unknown error status",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackTuple {
    pub timestamp: u32,
    pub device_token: [u8; DEVICE_TOKEN_LEN],
}

/// `timestamp:u32-be || token_len:u16-be=32 || token:32B`.
pub fn decode_feedback_tuple(buf: &[u8]) -> Result<FeedbackTuple, WireError> {
    if buf.len() < FEEDBACK_TUPLE_LEN {
        return Err(WireError::TooShort { got: buf.len(), need: FEEDBACK_TUPLE_LEN });
    }
    let timestamp = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let token_len = u16::from_be_bytes(buf[4..6].try_into().unwrap()) as usize;
    if token_len != DEVICE_TOKEN_LEN {
        return Err(WireError::TooShort { got: token_len, need: DEVICE_TOKEN_LEN });
    }
    let mut device_token = [0u8; DEVICE_TOKEN_LEN];
    device_token.copy_from_slice(&buf[6..6 + DEVICE_TOKEN_LEN]);
    Ok(FeedbackTuple { timestamp, device_token })
}
