// Message relay between the local application and the local Iris node.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::client::broadcast::BroadcastScheme;
use crate::client::publish::PublishScheme;
use crate::client::relay;
use crate::client::request::RequestScheme;
use crate::client::tunnel::{Tunnel, TunnelScheme};
use crate::config::{ServiceLimits, TopicLimits};
use crate::error::{Error, Result};
use crate::handlers::{ServiceHandler, TopicHandler};
use crate::validate;

// Process-wide tag for log correlation across concurrent connections.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) struct Core {
    pub(crate) writer: Arc<relay::RelayWriter>,
    pub(crate) broadcast: BroadcastScheme,
    pub(crate) request: RequestScheme,
    pub(crate) publish: PublishScheme,
    pub(crate) tunnel: TunnelScheme,
    conn_id: u64,
    // Reader outcome: the relay's close reason on a clean shutdown, or the
    // fatal error that tore the connection down.
    outcome: Mutex<Option<Result<String>>>,
    finished: Notify,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Core {
    /// Records the reader's terminal outcome and drains every pending
    /// operation with it.
    pub(crate) fn finish(&self, outcome: Result<String>) {
        let drain = match &outcome {
            Ok(_) => Error::Closed,
            Err(err) => err.fan_out(),
        };
        self.request.fail_all(&drain);
        self.tunnel.fail_all(&drain);
        {
            let mut slot = self.outcome.lock().expect("outcome lock");
            if slot.is_none() {
                *slot = Some(outcome);
            }
        }
        self.finished.notify_waiters();
    }

    fn outcome_snapshot(&self) -> Option<Result<String>> {
        let slot = self.outcome.lock().expect("outcome lock");
        slot.as_ref().map(|outcome| match outcome {
            Ok(reason) => Ok(reason.clone()),
            Err(err) => Err(err.fan_out()),
        })
    }
}

/// Handle to a relay connection, cheap to clone and share.
#[derive(Clone)]
pub struct Connection {
    core: Arc<Core>,
}

impl Connection {
    pub(crate) async fn establish(
        port: u16,
        cluster: &str,
        handler: Option<Arc<dyn ServiceHandler>>,
        limits: ServiceLimits,
    ) -> Result<Connection> {
        let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(conn_id, relay_port = port, cluster, "connecting to relay");

        let (reader, writer) = relay::connect_relay(port, cluster).await?;
        let core = Arc::new(Core {
            broadcast: BroadcastScheme::new(Arc::clone(&writer), &limits),
            request: RequestScheme::new(Arc::clone(&writer), &limits),
            publish: PublishScheme::new(Arc::clone(&writer)),
            tunnel: TunnelScheme::new(Arc::clone(&writer)),
            writer,
            conn_id,
            outcome: Mutex::new(None),
            finished: Notify::new(),
            reader: Mutex::new(None),
        });
        let reader_task = tokio::spawn(relay::run_reader(Arc::clone(&core), handler, reader));
        *core.reader.lock().expect("reader lock") = Some(reader_task);

        info!(conn_id, "relay connection established");
        Ok(Connection { core })
    }

    /// Broadcasts a message to all members of a cluster, best effort. The
    /// call returns once the message is flushed to the local relay.
    pub async fn broadcast(&self, cluster: &str, message: &[u8]) -> Result<()> {
        validate::remote_cluster(cluster)?;
        self.core.broadcast.broadcast(cluster, message).await
    }

    /// Issues a synchronous request, load-balanced across the cluster's
    /// members, and returns the reply. The timeout is in milliseconds; zero
    /// is rejected by the relay.
    pub async fn request(&self, cluster: &str, body: &[u8], timeout_ms: u64) -> Result<Bytes> {
        validate::remote_cluster(cluster)?;
        self.core.request.request(cluster, body, timeout_ms).await
    }

    /// Subscribes to a topic. There may be a short delay between the call
    /// returning and events being delivered, caused by subscription
    /// propagation through the network.
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn TopicHandler>,
        limits: Option<TopicLimits>,
    ) -> Result<()> {
        validate::topic(topic)?;
        self.core
            .publish
            .subscribe(topic, handler, limits.unwrap_or_default())
            .await
    }

    /// Publishes an event to all subscribers of a topic, best effort.
    pub async fn publish(&self, topic: &str, event: &[u8]) -> Result<()> {
        validate::topic(topic)?;
        self.core.publish.publish(topic, event).await
    }

    /// Unsubscribes from a topic; no further events are delivered for it.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        validate::topic(topic)?;
        self.core.publish.unsubscribe(topic).await
    }

    /// Opens a direct tunnel to a member of the cluster, allowing pairwise
    /// exclusive, order-guaranteed and throttled message passing. The
    /// timeout is in milliseconds.
    pub async fn tunnel(&self, cluster: &str, timeout_ms: u64) -> Result<Tunnel> {
        validate::remote_cluster(cluster)?;
        self.core.tunnel.open(cluster, timeout_ms).await
    }

    /// Gracefully tears the connection down: waits for the relay's close
    /// acknowledgement, drains the in-flight handlers, then releases the
    /// transport.
    pub async fn close(&self) -> Result<()> {
        if let Err(err) = self.core.writer.send_close().await {
            // The reader may have torn the connection down already; in that
            // case its outcome carries the real story.
            if self.core.outcome_snapshot().is_none() {
                return Err(err);
            }
        }
        let outcome = loop {
            let finished = self.core.finished.notified();
            if let Some(outcome) = self.core.outcome_snapshot() {
                break outcome;
            }
            finished.await;
        };

        let reader_task = self.core.reader.lock().expect("reader lock").take();
        if let Some(reader_task) = reader_task {
            let _ = reader_task.await;
        }

        // In-flight handlers drain before the writer goes away, so pending
        // replies still reach the wire.
        self.core.request.shutdown().await;
        self.core.broadcast.shutdown().await;
        self.core.publish.shutdown().await;
        self.core.writer.shutdown().await;

        debug!(conn_id = self.core.conn_id, "relay connection closed");
        match outcome {
            Ok(reason) if reason.is_empty() => Ok(()),
            // A forced teardown carries the relay's reason, surfaced the
            // same way a failed tunnel closure is.
            Ok(reason) => Err(Error::RemoteClose(reason)),
            Err(err) => Err(err),
        }
    }
}

/// Lifetime handle for a registered service instance.
pub struct Service {
    connection: Connection,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service").finish_non_exhaustive()
    }
}

impl Service {
    pub(crate) fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// The connection backing the service registration.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Unregisters the service and tears down its connection.
    pub async fn close(&self) -> Result<()> {
        self.connection.close().await
    }
}
