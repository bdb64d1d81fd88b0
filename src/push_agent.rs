//! Worker that pulls notifications off the durable queue and delivers them
//! to the push gateway over a single long-lived TLS connection.
//!
//! The gateway reports errors asynchronously and out of band: it may accept
//! a write and only report a problem with it (or an earlier one) on the
//! same socket moments later. We poll for that report between sends and
//! during idle stretches, correlating it back to a device token through
//! [`RecentNotificationWindow`].

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info, warn};

use crate::feedback::FeedbackItem;
use crate::notification::{humanize_epoch, Notification};
use crate::queue::PersistentQueue;
use crate::tls::{PushStream, TlsDialer};
use crate::token::{mask_device_token, TokenFormat};
use crate::wire::{self, ErrorFrame};
use crate::window::RecentNotificationWindow;

/// How many times a single notification may be (re)written to a freshly
/// dialed socket before it is given up on.
const MAX_TRIAL: u8 = 2;
/// Backoff used when reconnecting after a send failure or an error
/// response, distinct from the configured idle drain backoff.
const RECONNECT_RETRY_TIME: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct PushAgentConfig {
    pub gateway: (String, u16),
    pub max_notification_lag: i64,
    pub max_error_wait: f64,
    pub token_format: TokenFormat,
}

pub struct PushAgent {
    queue: PersistentQueue<Notification>,
    feedback_queue: PersistentQueue<FeedbackItem>,
    dialer: Arc<TlsDialer>,
    config: PushAgentConfig,
    window: RecentNotificationWindow,
    socket: Option<PushStream>,
}

enum DrainInterval {
    Blocking,
    Timed(Duration),
}

impl PushAgent {
    pub fn new(
        queue: PersistentQueue<Notification>,
        feedback_queue: PersistentQueue<FeedbackItem>,
        dialer: Arc<TlsDialer>,
        config: PushAgentConfig,
    ) -> Self {
        let window = RecentNotificationWindow::new(config.max_error_wait);
        Self { queue, feedback_queue, dialer, config, window, socket: None }
    }

    pub async fn run(mut self) {
        let mut drain = DrainInterval::Blocking;
        loop {
            let pulled = match &drain {
                DrainInterval::Blocking => Some(self.queue.get().await),
                DrainInterval::Timed(d) => match tokio::time::timeout(*d, self.queue.get()).await {
                    Ok(result) => Some(result),
                    Err(_elapsed) => None,
                },
            };

            let (rowid, notification) = match pulled {
                None => {
                    if self.socket_has_pending_error().await {
                        self.handle_error_response().await;
                        drain = DrainInterval::Blocking;
                    } else {
                        drain = self.back_off(drain);
                    }
                    continue;
                }
                Some(Ok(pair)) => pair,
                Some(Err(e)) => {
                    error!(error = %e, "push queue store failure, agent exiting");
                    return;
                }
            };

            self.process_item(rowid, notification).await;
            drain = DrainInterval::Timed(Duration::from_secs(1));
        }
    }

    fn back_off(&self, drain: DrainInterval) -> DrainInterval {
        if self.socket.is_none() {
            return DrainInterval::Blocking;
        }
        match drain {
            DrainInterval::Blocking => DrainInterval::Timed(Duration::from_secs(1)),
            DrainInterval::Timed(d) => {
                let doubled = d * 2;
                if doubled > Duration::from_secs(10) {
                    DrainInterval::Blocking
                } else {
                    DrainInterval::Timed(doubled)
                }
            }
        }
    }

    async fn socket_has_pending_error(&mut self) -> bool {
        let Some(socket) = self.socket.as_mut() else { return false };
        let (tcp, _) = socket.get_ref();
        matches!(tokio::time::timeout(Duration::from_millis(0), tcp.readable()).await, Ok(Ok(())))
    }

    async fn process_item(&mut self, rowid: i64, notification: Notification) {
        let now_ts = now();
        if notification.expiry_at < now_ts {
            info!(
                id = notification.id,
                expiry_at = %humanize_epoch(notification.expiry_at),
                "discarding expired notification"
            );
            crate::metrics::record_notification_dropped("expired");
            self.ack(rowid, "dropped expired notification");
            return;
        }

        let lag = now_ts - notification.created_at;
        if lag > self.config.max_notification_lag {
            info!(id = notification.id, lag, max = self.config.max_notification_lag, "discarding notification, too old to deliver");
            crate::metrics::record_notification_dropped("stale");
            self.ack(rowid, "dropped stale notification");
            return;
        }

        let frame = wire::encode_notification_frame(
            notification.id,
            clamp_expiry_for_wire(notification.expiry_at),
            &notification.device_token.0,
            &notification.payload,
        );

        if self.socket.is_none() {
            self.socket = self
                .dialer
                .dial(&self.config.gateway, RECONNECT_RETRY_TIME, "push gateway connect")
                .await;
        }

        let mut trial = 0u8;
        let sent = loop {
            let Some(socket) = self.socket.as_mut() else { break false };
            match socket.write_all(&frame).await {
                Ok(()) => break true,
                Err(e) => {
                    warn!(id = notification.id, error = %e, trial, "write to push gateway failed");
                    self.handle_error_response().await;
                    trial += 1;
                    if trial >= MAX_TRIAL {
                        break false;
                    }
                    self.socket = self
                        .dialer
                        .dial(&self.config.gateway, RECONNECT_RETRY_TIME, "push gateway reconnect")
                        .await;
                }
            }
        };

        if !sent {
            warn!(id = notification.id, "giving up on notification after repeated send failures");
            crate::metrics::record_notification_dropped("send_failed");
            self.ack(rowid, "dropped undeliverable notification");
            return;
        }

        self.window.record(notification.id, notification.device_token);
        self.ack(rowid, "acked sent notification");
        crate::metrics::record_notification_sent();
        info!(id = notification.id, "notification sent");

        if self.config.max_error_wait > 0.0 {
            if let Some(socket) = self.socket.as_mut() {
                let (tcp, _) = socket.get_ref();
                let wait = Duration::from_secs_f64(self.config.max_error_wait);
                if tokio::time::timeout(wait, tcp.readable()).await.is_ok() {
                    self.handle_error_response().await;
                }
            }
        }
    }

    fn ack(&self, rowid: i64, context: &str) {
        if let Err(e) = self.queue.ack(rowid) {
            error!(error = %e, context, "failed to ack push queue row");
        }
    }

    /// Reads one error frame off the current socket, correlates it to a
    /// device token, records invalid tokens to the feedback queue, and
    /// always closes the socket afterward: the gateway never keeps a
    /// connection open after reporting an error.
    async fn handle_error_response(&mut self) {
        let Some(mut socket) = self.socket.take() else { return };
        let mut buf = [0u8; wire::ERROR_FRAME_LEN];
        match socket.read_exact(&mut buf).await {
            Ok(_) => match wire::decode_error_frame(&buf) {
                Ok(ErrorFrame { status, id }) => {
                    let token = self.window.lookup(id);
                    let token_text = token.map(|t| self.config.token_format.format(&t));
                    warn!(
                        id,
                        status,
                        reason = wire::status_reason(status),
                        token = %token_text.as_deref().map(mask_device_token).unwrap_or_else(|| "unknown".to_string()),
                        "push gateway reported an error"
                    );
                    crate::metrics::record_gateway_error(status);
                    if status == wire::INVALID_TOKEN_STATUS {
                        let token_text = token_text.unwrap_or_else(|| "unknown".to_string());
                        // The gateway's error frame carries no timestamp of its own;
                        // the relay reports a sentinel "0" rather than inventing one.
                        if let Err(e) = self.feedback_queue.put(&FeedbackItem {
                            timestamp: "0".to_string(),
                            device_token_text: token_text,
                        }) {
                            error!(error = %e, "failed to enqueue invalid-token feedback");
                        } else {
                            crate::metrics::record_feedback_enqueued();
                        }
                    }
                }
                Err(e) => warn!(error = %e, "unreadable error frame from push gateway"),
            },
            Err(e) => warn!(error = %e, "push gateway connection closed before error frame was read"),
        }
        let _ = socket.shutdown().await;
    }
}

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

/// Bounds an `expiry_at` to what the wire format's `u32` field can hold,
/// instead of letting an out-of-range value wrap silently.
fn clamp_expiry_for_wire(expiry_at: i64) -> u32 {
    expiry_at.clamp(0, u32::MAX as i64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_expiry_leaves_in_range_values_untouched() {
        assert_eq!(clamp_expiry_for_wire(1_700_000_000), 1_700_000_000);
    }

    #[test]
    fn clamp_expiry_floors_negative_values_at_zero() {
        assert_eq!(clamp_expiry_for_wire(-5), 0);
    }

    #[test]
    fn clamp_expiry_caps_values_beyond_u32_instead_of_wrapping() {
        assert_eq!(clamp_expiry_for_wire(u32::MAX as i64 + 100), u32::MAX);
    }
}
