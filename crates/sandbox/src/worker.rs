//! Isolate worker: the sandbox side of the boundary.
//!
//! Each isolate is two tasks. The router fans inbound host messages to the
//! right place: load/call/hook/event become jobs, responses complete the
//! mediated calls the executor is waiting on. The executor task runs jobs
//! one at a time (plugin execution is single-threaded, like the runtime it
//! models), so a slow call delays later traffic on the same channel but
//! never other plugins.

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dplug_protocol::{HostMessage, RequestId, SandboxMessage};

use crate::executor::{ExecError, HostBridge, PluginExecutor};

const ISOLATE_QUEUE_CAPACITY: usize = 64;

/// Host-side handle to a spawned isolate.
pub(crate) struct Isolate {
    pub(crate) inbound: mpsc::Sender<HostMessage>,
    cancel: CancellationToken,
}

impl Isolate {
    /// Stop both isolate tasks. Idempotent.
    pub(crate) fn terminate(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Isolate {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawn the router/executor task pair for one plugin.
pub(crate) fn spawn_isolate(
    plugin_id: String,
    executor: Box<dyn PluginExecutor>,
    to_host: mpsc::Sender<SandboxMessage>,
) -> Isolate {
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<HostMessage>(ISOLATE_QUEUE_CAPACITY);
    let (job_tx, mut job_rx) = mpsc::channel::<HostMessage>(ISOLATE_QUEUE_CAPACITY);
    let bridge = HostBridge::new(to_host.clone());
    let cancel = CancellationToken::new();

    let router_bridge = bridge.clone();
    let router_cancel = cancel.clone();
    let router_plugin = plugin_id.clone();
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                () = router_cancel.cancelled() => break,
                message = inbound_rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            match message {
                HostMessage::Response {
                    request_id,
                    success,
                    result,
                    error,
                } => router_bridge.complete(request_id, success, result, error).await,
                other => {
                    if job_tx.send(other).await.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(plugin = %router_plugin, "isolate router stopped");
    });

    let executor_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut executor = executor;
        loop {
            let job = tokio::select! {
                () = executor_cancel.cancelled() => break,
                job = job_rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            match job {
                HostMessage::Load {
                    request_id,
                    code,
                    context,
                } => {
                    let outcome = executor
                        .load(&code, &context, &bridge)
                        .await
                        .map(|exports| json!(exports));
                    respond(&to_host, request_id, outcome).await;
                }
                HostMessage::Call {
                    request_id,
                    method,
                    args,
                } => {
                    let outcome = executor.invoke(&method, &args, &bridge).await;
                    respond(&to_host, request_id, outcome).await;
                }
                HostMessage::Hook {
                    request_id,
                    hook,
                    data,
                } => {
                    let outcome = executor.hook(hook, &data, &bridge).await;
                    respond(&to_host, request_id, outcome).await;
                }
                HostMessage::Event { name, payload } => {
                    executor.on_event(&name, &payload, &bridge).await;
                }
                // Responses are routed to the bridge before jobs are queued.
                HostMessage::Response { .. } => {}
            }
        }
        tracing::debug!(plugin = %plugin_id, "isolate executor stopped");
    });

    Isolate {
        inbound: inbound_tx,
        cancel,
    }
}

async fn respond(
    to_host: &mpsc::Sender<SandboxMessage>,
    request_id: RequestId,
    outcome: Result<Value, ExecError>,
) {
    let message = match outcome {
        Ok(result) => SandboxMessage::Response {
            request_id,
            success: true,
            result: Some(result),
            error: None,
        },
        Err(error) => SandboxMessage::Response {
            request_id,
            success: false,
            result: None,
            error: Some(error.to_string()),
        },
    };
    // The host may already have torn the channel down; nothing to do then.
    let _ = to_host.send(message).await;
}
