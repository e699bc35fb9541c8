//! Outbound message transport and retrying dispatch.
//!
//! The engine only needs per-message acceptance from the provider; rendering
//! and SMTP/API mechanics live behind the `Transport` trait.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use campaign_core::StoreId;

use crate::retry::RetryPolicy;

/// One message handed to the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Recipient id for campaign sends, enrollment step id for recovery sends.
    pub message_id: Uuid,
    pub store_id: StoreId,
    pub campaign_id: Option<Uuid>,
    pub to: String,
    pub from_name: String,
    pub from_address: String,
    pub subject: String,
    /// Opaque reference to the rendered body.
    pub content_ref: String,
    #[serde(default)]
    pub offer_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SendOutcome {
    Accepted { provider_message_id: String },
    /// Permanent per-message rejection. Not retried.
    Rejected { reason: String },
}

/// Transient transport errors. Retried according to the dispatch policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("transport send timed out")]
    Timeout,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<SendOutcome, TransportError>;
}

/// Final result of a send after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    Accepted {
        provider_message_id: String,
        attempts: u32,
    },
    Failed {
        reason: String,
        attempts: u32,
    },
}

impl DispatchResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Sends one message, retrying transient errors and timeouts with backoff.
pub async fn dispatch_with_retry(
    transport: &dyn Transport,
    message: &OutboundMessage,
    send_timeout: Duration,
    policy: &RetryPolicy,
) -> DispatchResult {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let result = match tokio::time::timeout(send_timeout, transport.send(message)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        match result {
            Ok(SendOutcome::Accepted { provider_message_id }) => {
                metrics::counter!("dispatch.accepted").increment(1);
                return DispatchResult::Accepted {
                    provider_message_id,
                    attempts,
                };
            }
            Ok(SendOutcome::Rejected { reason }) => {
                metrics::counter!("dispatch.failed", "cause" => "rejected").increment(1);
                debug!(message_id = %message.message_id, reason = %reason, "Message rejected");
                return DispatchResult::Failed {
                    reason: format!("rejected: {reason}"),
                    attempts,
                };
            }
            Err(e) if policy.should_retry(attempts) => {
                let delay = policy.delay_for(attempts);
                warn!(
                    message_id = %message.message_id,
                    attempt = attempts,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Transient send failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                metrics::counter!("dispatch.failed", "cause" => "exhausted").increment(1);
                return DispatchResult::Failed {
                    reason: format!("{e} after {attempts} attempts"),
                    attempts,
                };
            }
        }
    }
}

/// Transport that accepts everything and logs it. Used by the demo binary.
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<SendOutcome, TransportError> {
        info!(
            to = %message.to,
            subject = %message.subject,
            campaign_id = ?message.campaign_id,
            offer = message.offer_code.as_deref().unwrap_or(""),
            "Sending message"
        );
        Ok(SendOutcome::Accepted {
            provider_message_id: format!("msg-{}", Uuid::new_v4()),
        })
    }
}

/// In-memory transport that records accepted messages and can be told to
/// reject specific addresses or fail a number of calls.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<OutboundMessage>>,
    rejected_addresses: Mutex<HashSet<String>>,
    failures_remaining: AtomicU32,
    calls: AtomicU32,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_address(&self, address: impl Into<String>) {
        self.rejected_addresses.lock().insert(address.into());
    }

    /// The next `n` calls fail with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, address: &str) -> usize {
        self.sent.lock().iter().filter(|m| m.to == address).count()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<SendOutcome, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Unavailable("provider returned 503".into()));
        }
        if self.rejected_addresses.lock().contains(&message.to) {
            return Ok(SendOutcome::Rejected {
                reason: "mailbox unavailable".into(),
            });
        }
        self.sent.lock().push(message.clone());
        Ok(SendOutcome::Accepted {
            provider_message_id: format!("rec-{}", message.message_id),
        })
    }
}
