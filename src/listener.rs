//! Request/reply control socket: accepts `send` and `feedback` commands from
//! local clients and replies with a single line, one request per `recv`.
//!
//! Every operation this module performs against the queues is synchronous,
//! so the listener runs on its own blocking OS thread rather than inside
//! the async runtime.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::error::CommandError;
use crate::feedback::FeedbackItem;
use crate::ident::IdentCounter;
use crate::notification::{Notification, MAX_PAYLOAD_LEN};
use crate::queue::PersistentQueue;
use crate::token::{parse_device_token, DeviceToken};

pub struct Listener {
    socket: zmq::Socket,
    push_queue: PersistentQueue<Notification>,
    feedback_queue: PersistentQueue<FeedbackItem>,
    ident: IdentCounter,
}

impl Listener {
    pub fn bind(
        ctx: &zmq::Context,
        bind_addr: &str,
        push_queue: PersistentQueue<Notification>,
        feedback_queue: PersistentQueue<FeedbackItem>,
        ident: IdentCounter,
    ) -> Result<Self, zmq::Error> {
        let socket = ctx.socket(zmq::REP)?;
        socket.bind(bind_addr)?;
        info!(bind_addr, "control socket bound");
        Ok(Self { socket, push_queue, feedback_queue, ident })
    }

    /// Blocks the calling thread forever, handling one request per
    /// iteration: receive, reply, repeat. A malformed or unreadable request
    /// still gets a reply, since REP sockets require exactly one send per
    /// recv to stay in sync.
    pub fn run(mut self) {
        loop {
            let msg = match self.socket.recv_msg(0) {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "control socket recv failed");
                    continue;
                }
            };

            let reply = match msg.as_str() {
                Some(text) => self.handle_request(text),
                None => "ERROR request is not valid UTF-8".to_string(),
            };

            if let Err(e) = self.socket.send(&reply, 0) {
                warn!(error = %e, "failed to send control socket reply");
            }
        }
    }

    fn handle_request(&mut self, text: &str) -> String {
        let lower = text.to_ascii_lowercase();
        if lower.starts_with("send ") {
            match parse_send(text, MAX_PAYLOAD_LEN) {
                Ok((expiry, tokens, payload)) => self.perform_send(expiry, tokens, payload),
                Err(e) => {
                    warn!(error = %e, request = text, "invalid send request");
                    format!("ERROR {e}")
                }
            }
        } else if lower.starts_with("feedback") {
            self.perform_feedback()
        } else {
            warn!(request = text, "invalid request");
            "ERROR Invalid input".to_string()
        }
    }

    fn perform_send(&mut self, expiry: i64, tokens: Vec<DeviceToken>, payload: Vec<u8>) -> String {
        let n = tokens.len() as u32;
        let start_id = match self.ident.reserve(n) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "failed to reserve notification ids");
                return "ERROR internal error reserving notification ids".to_string();
            }
        };

        let created_at = now();
        let mut ids = Vec::with_capacity(tokens.len());
        for (i, token) in tokens.into_iter().enumerate() {
            let id = start_id.wrapping_add(i as u32);
            let notification = Notification {
                id,
                created_at,
                expiry_at: expiry,
                device_token: token,
                payload: payload.clone(),
            };
            if let Err(e) = self.push_queue.put(&notification) {
                warn!(error = %e, id, "failed to enqueue notification");
                return "ERROR internal error enqueueing notification".to_string();
            }
            ids.push(id.to_string());
        }

        if ids.is_empty() {
            "OK".to_string()
        } else {
            format!("OK {}", ids.join(" "))
        }
    }

    fn perform_feedback(&mut self) -> String {
        match self.feedback_queue.drain_all() {
            Ok(items) if items.is_empty() => "OK".to_string(),
            Ok(items) => {
                let parts: Vec<String> = items
                    .into_iter()
                    .map(|item| format!("{}:{}", item.timestamp, item.device_token_text))
                    .collect();
                format!("OK {}", parts.join(" "))
            }
            Err(e) => {
                warn!(error = %e, "feedback queue read failure");
                "ERROR internal error reading feedback queue".to_string()
            }
        }
    }
}

/// Parses `send <expiry> <count> <token>... <payload>`. `expiry` is either
/// an absolute unix timestamp or `+<seconds-from-now>`. `payload` is every
/// byte left on the line after the last token, verbatim.
pub fn parse_send(msg: &str, max_payload_len: usize) -> Result<(i64, Vec<DeviceToken>, Vec<u8>), CommandError> {
    let after_cmd = msg.get(5..).ok_or_else(|| CommandError::Malformed("missing arguments".to_string()))?;

    let (expiry_str, after_expiry) = split_first_token(after_cmd);
    if expiry_str.is_empty() {
        return Err(CommandError::Malformed("missing expiry".to_string()));
    }
    let expiry = parse_expiry(expiry_str)?;

    let (ntok_str, mut cursor) = split_first_token(after_expiry);
    if ntok_str.is_empty() {
        return Err(CommandError::Malformed("missing token count".to_string()));
    }
    let ntok: usize = ntok_str
        .parse()
        .map_err(|_| CommandError::Malformed(format!("invalid token count {ntok_str:?}")))?;
    // A token is never shorter than one character on the wire, so a count
    // bigger than what's left of the request can't possibly be satisfied.
    // Rejecting it here avoids taking an attacker-controlled `ntok` as an
    // allocation size below.
    if ntok > after_expiry.len() {
        return Err(CommandError::Malformed(format!("token count {ntok} exceeds request length")));
    }

    let mut tokens = Vec::with_capacity(ntok);
    for _ in 0..ntok {
        let (tok_str, rest) = split_first_token(cursor);
        if tok_str.is_empty() {
            return Err(CommandError::Malformed("too few device tokens".to_string()));
        }
        tokens.push(parse_device_token(tok_str)?);
        cursor = rest;
    }

    let payload = cursor.as_bytes().to_vec();
    if payload.len() > max_payload_len {
        return Err(CommandError::PayloadTooLong(payload.len()));
    }
    Ok((expiry, tokens, payload))
}

pub fn parse_expiry(s: &str) -> Result<i64, CommandError> {
    if let Some(rest) = s.strip_prefix('+') {
        let offset: i64 = rest.parse().map_err(|_| CommandError::InvalidExpiry(s.to_string()))?;
        Ok(now() + offset)
    } else {
        s.parse::<i64>().map_err(|_| CommandError::InvalidExpiry(s.to_string()))
    }
}

/// Splits off the first whitespace-delimited word, consuming any run of
/// leading whitespace before it and the separating run of whitespace after
/// it, but leaving the remainder's interior untouched so payload bytes
/// survive intact.
fn split_first_token(s: &str) -> (&str, &str) {
    let s = s.trim_start_matches(char::is_whitespace);
    match s.find(char::is_whitespace) {
        Some(idx) => {
            let (word, rest) = s.split_at(idx);
            (word, rest.trim_start_matches(char::is_whitespace))
        }
        None => (s, ""),
    }
}

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}
