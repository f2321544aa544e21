//! Request/response correlation across the isolation boundary.
//!
//! Every outbound request registers a pending entry keyed by a fresh
//! [`RequestId`] before it is sent; the matching [`SandboxMessage::Response`]
//! resolves or rejects it and cancels the timeout. Responses with no pending
//! entry are discarded. A timeout removes the entry and rejects the caller;
//! the in-flight sandbox work is left to finish unobserved.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use dplug_protocol::{HostMessage, RequestId};

/// Failure modes for a correlated request.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    /// No response arrived within the deadline.
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The sandbox answered with an error.
    #[error("{0}")]
    Rejected(String),

    /// The isolate's channel closed before a response arrived.
    #[error("sandbox channel closed")]
    ChannelClosed,
}

type PendingSender = oneshot::Sender<Result<Value, RequestError>>;

/// Correlates host-originated requests with sandbox responses.
///
/// Request ids are unique across all plugins, so one broker serves every
/// isolate; ordering within one plugin's channel is preserved by the
/// channel itself.
pub struct MessageBroker {
    pending: Mutex<HashMap<RequestId, PendingSender>>,
}

impl MessageBroker {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Send the message produced by `build` on `channel` and await the
    /// matching response.
    pub async fn request<F>(
        &self,
        channel: &mpsc::Sender<HostMessage>,
        timeout: Duration,
        build: F,
    ) -> Result<Value, RequestError>
    where
        F: FnOnce(RequestId) -> HostMessage,
    {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        if channel.send(build(request_id)).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(RequestError::ChannelClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Pending sender dropped: the isolate was terminated.
            Ok(Err(_)) => Err(RequestError::ChannelClosed),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(RequestError::Timeout(timeout))
            }
        }
    }

    /// Route a sandbox response to its pending request.
    ///
    /// Responses for unknown ids (already timed out, or never issued) are
    /// discarded.
    pub async fn complete(
        &self,
        request_id: RequestId,
        success: bool,
        result: Option<Value>,
        error: Option<String>,
    ) {
        let Some(tx) = self.pending.lock().await.remove(&request_id) else {
            tracing::debug!(%request_id, "discarding response with no pending request");
            return;
        };
        let outcome = if success {
            Ok(result.unwrap_or(Value::Null))
        } else {
            Err(RequestError::Rejected(
                error.unwrap_or_else(|| "unknown sandbox error".to_string()),
            ))
        };
        // The receiver may have been dropped between timeout and removal.
        let _ = tx.send(outcome);
    }

    /// Number of requests still awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl Default for MessageBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call_message(request_id: RequestId) -> HostMessage {
        HostMessage::Call {
            request_id,
            method: "ping".into(),
            args: vec![],
        }
    }

    #[tokio::test]
    async fn response_resolves_pending_request() {
        let broker = MessageBroker::new();
        let (tx, mut rx) = mpsc::channel(4);

        let request = broker.request(&tx, Duration::from_secs(5), call_message);
        let completion = async {
            let Some(HostMessage::Call { request_id, .. }) = rx.recv().await else {
                panic!("expected call message");
            };
            broker
                .complete(request_id, true, Some(json!("pong")), None)
                .await;
        };

        let (outcome, ()) = tokio::join!(request, completion);
        assert_eq!(outcome.unwrap(), json!("pong"));
        assert_eq!(broker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn error_response_rejects_pending_request() {
        let broker = MessageBroker::new();
        let (tx, mut rx) = mpsc::channel(4);

        let request = broker.request(&tx, Duration::from_secs(5), call_message);
        let completion = async {
            let Some(HostMessage::Call { request_id, .. }) = rx.recv().await else {
                panic!("expected call message");
            };
            broker
                .complete(request_id, false, None, Some("boom".into()))
                .await;
        };

        let (outcome, ()) = tokio::join!(request, completion);
        match outcome {
            Err(RequestError::Rejected(message)) => assert_eq!(message, "boom"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_removes_pending_entry() {
        let broker = MessageBroker::new();
        let (tx, _rx) = mpsc::channel(4);

        let outcome = broker
            .request(&tx, Duration::from_millis(20), call_message)
            .await;
        assert!(matches!(outcome, Err(RequestError::Timeout(_))));
        assert_eq!(broker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn unmatched_response_is_discarded() {
        let broker = MessageBroker::new();
        broker
            .complete(Uuid::new_v4(), true, Some(json!(1)), None)
            .await;
        assert_eq!(broker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn closed_channel_rejects_immediately() {
        let broker = MessageBroker::new();
        let (tx, rx) = mpsc::channel(4);
        drop(rx);

        let outcome = broker
            .request(&tx, Duration::from_secs(5), call_message)
            .await;
        assert!(matches!(outcome, Err(RequestError::ChannelClosed)));
        assert_eq!(broker.pending_count().await, 0);
    }
}
