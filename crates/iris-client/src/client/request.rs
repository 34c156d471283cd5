// Request scheme: correlated request/reply with relay-enforced timeouts.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

use crate::client::relay::RelayWriter;
use crate::config::ServiceLimits;
use crate::error::{Error, Result};
use crate::handlers::ServiceHandler;
use crate::pool::{Terminate, WorkerPool};

pub(crate) struct RequestScheme {
    writer: Arc<RelayWriter>,
    workers: WorkerPool,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Bytes>>>>,
}

// Deregisters a pending request on every exit path, including caller
// cancellation, so a late reply for the id is silently discarded.
struct PendingGuard<'a> {
    scheme: &'a RequestScheme,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.scheme
            .pending
            .lock()
            .expect("pending lock")
            .remove(&self.id);
    }
}

impl RequestScheme {
    pub(crate) fn new(writer: Arc<RelayWriter>, limits: &ServiceLimits) -> Self {
        Self {
            writer,
            workers: WorkerPool::new(limits.request_workers, limits.request_memory),
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Issues a load-balanced request to the cluster and waits for the
    /// reply. The timeout is enforced by the relay, which answers with a
    /// timeout-flagged reply when it expires.
    pub(crate) async fn request(
        &self,
        cluster: &str,
        body: &[u8],
        timeout_ms: u64,
    ) -> Result<Bytes> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (reply_tx, reply_rx) = oneshot::channel();
        // The entry must be registered before the frame hits the wire: the
        // relay may answer before the send call returns.
        self.pending
            .lock()
            .expect("pending lock")
            .insert(id, reply_tx);
        let _guard = PendingGuard { scheme: self, id };

        self.writer.send_request(id, cluster, body, timeout_ms).await?;
        reply_rx.await.map_err(|_| Error::Closed)?
    }

    /// Runs an inbound request through the worker pool and forwards the
    /// handler's reply. Handler errors are flattened into the reply's error
    /// string; they never touch the connection.
    pub(crate) async fn dispatch(
        &self,
        handler: Option<&Arc<dyn ServiceHandler>>,
        id: u64,
        body: Bytes,
        timeout_ms: u64,
    ) {
        let Some(handler) = handler else {
            debug!(id, "request for a pure client connection dropped");
            return;
        };
        let handler = Arc::clone(handler);
        let writer = Arc::clone(&self.writer);
        let cost = body.len();
        let admitted = self
            .workers
            .schedule(cost, timeout_ms, async move {
                let outcome = match handler.handle_request(body).await {
                    Ok(reply) => writer.send_reply_success(id, &reply).await,
                    Err(err) => writer.send_reply_failure(id, &format!("{err:#}")).await,
                };
                if let Err(err) = outcome {
                    debug!(id, error = %err, "reply could not be forwarded");
                }
            })
            .await;
        if !admitted {
            debug!(id, cost, "inbound request dropped: exceeds the memory allowance");
        }
    }

    /// Fulfils the pending request, if its caller is still waiting.
    pub(crate) fn complete(&self, id: u64, outcome: Result<Bytes>) {
        if let Some(reply_tx) = self.pending.lock().expect("pending lock").remove(&id) {
            let _ = reply_tx.send(outcome);
        }
    }

    /// Fails every pending request with the connection's terminal error.
    pub(crate) fn fail_all(&self, err: &Error) {
        for (_, reply_tx) in self.pending.lock().expect("pending lock").drain() {
            let _ = reply_tx.send(Err(err.fan_out()));
        }
    }

    pub(crate) async fn shutdown(&self) {
        self.workers.terminate(Terminate::Graceful).await;
    }
}
