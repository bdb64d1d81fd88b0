use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::TokenParseError;

pub const DEVICE_TOKEN_LEN: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceToken(pub [u8; DEVICE_TOKEN_LEN]);

impl std::fmt::Debug for DeviceToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceToken({})", hex::encode(self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFormat {
    Hex,
    Base64,
}

impl TokenFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hex" => Some(Self::Hex),
            "base64" => Some(Self::Base64),
            _ => None,
        }
    }

    pub fn format(&self, token: &DeviceToken) -> String {
        match self {
            TokenFormat::Hex => hex::encode(token.0),
            TokenFormat::Base64 => BASE64.encode(token.0),
        }
    }
}

/// Accepts a device token as either 64 hex characters or the base64
/// encoding of the raw 32 bytes, the same two forms the control socket
/// grammar allows.
pub fn parse_device_token(input: &str) -> Result<DeviceToken, TokenParseError> {
    let bytes = if input.len() == DEVICE_TOKEN_LEN * 2 && input.bytes().all(|b| b.is_ascii_hexdigit()) {
        hex::decode(input).map_err(|_| TokenParseError::InvalidBase64(input.to_string()))?
    } else {
        BASE64
            .decode(input)
            .map_err(|_| TokenParseError::InvalidBase64(input.to_string()))?
    };

    if bytes.len() != DEVICE_TOKEN_LEN {
        return Err(TokenParseError::WrongLength {
            got: bytes.len(),
            input: input.to_string(),
        });
    }
    let mut arr = [0u8; DEVICE_TOKEN_LEN];
    arr.copy_from_slice(&bytes);
    Ok(DeviceToken(arr))
}

/// Shortens a token's text form for log lines, so a device identifier never
/// appears in full in the logs.
pub fn mask_device_token(text: &str) -> String {
    if text.len() <= 12 {
        return format!("{}...", &text[..text.len().min(4)]);
    }
    format!("{}...{}", &text[..8], &text[text.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_hex() {
        let raw = [7u8; DEVICE_TOKEN_LEN];
        let text = hex::encode(raw);
        let token = parse_device_token(&text).unwrap();
        assert_eq!(token.0, raw);
    }

    #[test]
    fn round_trips_base64() {
        let raw = [9u8; DEVICE_TOKEN_LEN];
        let text = BASE64.encode(raw);
        let token = parse_device_token(&text).unwrap();
        assert_eq!(token.0, raw);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = parse_device_token("AAAA").unwrap_err();
        assert!(matches!(err, TokenParseError::WrongLength { .. }));
    }

    #[test]
    fn masks_a_full_length_hex_token() {
        let text = hex::encode([0xabu8; DEVICE_TOKEN_LEN]);
        let masked = mask_device_token(&text);
        assert_eq!(masked, format!("{}...{}", &text[..8], &text[text.len() - 4..]));
        assert!(!masked.contains(&text[10..text.len() - 6]), "masked form must not leak the middle of the token");
    }

    #[test]
    fn masks_a_short_string_without_panicking() {
        assert_eq!(mask_device_token("ab"), "ab...");
    }
}
