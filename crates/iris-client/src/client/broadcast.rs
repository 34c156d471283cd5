// Broadcast scheme: fire-and-forget fan-out to a cluster.
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::client::relay::RelayWriter;
use crate::config::ServiceLimits;
use crate::error::Result;
use crate::handlers::ServiceHandler;
use crate::pool::{Terminate, WorkerPool};

pub(crate) struct BroadcastScheme {
    writer: Arc<RelayWriter>,
    workers: WorkerPool,
}

impl BroadcastScheme {
    pub(crate) fn new(writer: Arc<RelayWriter>, limits: &ServiceLimits) -> Self {
        Self {
            writer,
            workers: WorkerPool::new(limits.broadcast_workers, limits.broadcast_memory),
        }
    }

    /// Relays a broadcast to all members of the cluster; returns once the
    /// frame has been flushed to the local relay.
    pub(crate) async fn broadcast(&self, cluster: &str, message: &[u8]) -> Result<()> {
        self.writer.send_broadcast(cluster, message).await
    }

    pub(crate) async fn dispatch(
        &self,
        handler: Option<&Arc<dyn ServiceHandler>>,
        message: Bytes,
    ) {
        let Some(handler) = handler else {
            debug!("broadcast for a pure client connection dropped");
            return;
        };
        let handler = Arc::clone(handler);
        let cost = message.len();
        let admitted = self
            .workers
            .schedule(cost, 0, async move {
                handler.handle_broadcast(message).await;
            })
            .await;
        if !admitted {
            debug!(cost, "broadcast dropped: exceeds the memory allowance");
        }
    }

    pub(crate) async fn shutdown(&self) {
        self.workers.terminate(Terminate::Graceful).await;
    }
}
