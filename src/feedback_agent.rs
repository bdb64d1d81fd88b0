//! Worker that drains the feedback gateway's stream of invalid-token
//! reports into the durable feedback queue.
//!
//! The feedback gateway is a push source, not a request/reply service: once
//! connected it simply streams fixed-size tuples and eventually closes the
//! connection. There is nothing to retry mid-stream; on any read failure or
//! clean close we reconnect after `frequency`.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

use crate::feedback::FeedbackItem;
use crate::queue::PersistentQueue;
use crate::tls::{PushStream, TlsDialer};
use crate::token::{mask_device_token, DeviceToken, TokenFormat};
use crate::wire::{self, FEEDBACK_TUPLE_LEN};

pub struct FeedbackAgentConfig {
    pub gateway: (String, u16),
    pub frequency: Duration,
    pub token_format: TokenFormat,
}

pub struct FeedbackAgent {
    queue: PersistentQueue<FeedbackItem>,
    dialer: Arc<TlsDialer>,
    config: FeedbackAgentConfig,
    socket: Option<PushStream>,
}

impl FeedbackAgent {
    /// `inherited_socket` is the boot-time probe connection to the feedback
    /// gateway, already proven live; the vendor starts streaming tuples the
    /// moment it accepts the connection, so that socket is handed off here
    /// rather than closed and redialed.
    pub fn new(
        queue: PersistentQueue<FeedbackItem>,
        dialer: Arc<TlsDialer>,
        config: FeedbackAgentConfig,
        inherited_socket: Option<PushStream>,
    ) -> Self {
        Self { queue, dialer, config, socket: inherited_socket }
    }

    pub async fn run(mut self) {
        loop {
            if self.socket.is_none() {
                tokio::time::sleep(self.config.frequency).await;
                self.socket = self
                    .dialer
                    .dial(&self.config.gateway, self.config.frequency, "feedback gateway connect")
                    .await;
            }

            let Some(mut socket) = self.socket.take() else { continue };
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];

            loop {
                match socket.read(&mut chunk).await {
                    Ok(0) => {
                        if !buf.is_empty() {
                            warn!(remaining = buf.len(), "trailing partial tuple from feedback gateway");
                        }
                        break;
                    }
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        self.drain_complete_tuples(&mut buf);
                    }
                    Err(e) => {
                        warn!(error = %e, "feedback connection read error");
                        break;
                    }
                }
            }

            let _ = socket.shutdown().await;
            drop(socket);
            self.socket = None;
        }
    }

    fn drain_complete_tuples(&self, buf: &mut Vec<u8>) {
        while buf.len() >= FEEDBACK_TUPLE_LEN {
            let tuple_bytes: Vec<u8> = buf.drain(..FEEDBACK_TUPLE_LEN).collect();
            match wire::decode_feedback_tuple(&tuple_bytes) {
                Ok(tuple) => {
                    let token_text = self.config.token_format.format(&DeviceToken(tuple.device_token));
                    let timestamp = tuple.timestamp.to_string();
                    info!(
                        timestamp = %timestamp,
                        token = %mask_device_token(&token_text),
                        "feedback gateway reported an invalid token"
                    );
                    if let Err(e) = self.queue.put(&FeedbackItem {
                        timestamp,
                        device_token_text: token_text,
                    }) {
                        warn!(error = %e, "failed to enqueue feedback tuple");
                    } else {
                        crate::metrics::record_feedback_enqueued();
                    }
                }
                Err(e) => warn!(error = %e, "malformed feedback tuple, dropping"),
            }
        }
    }
}
