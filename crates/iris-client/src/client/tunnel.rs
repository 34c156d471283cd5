// Tunnel scheme: ordered, credit-flow-controlled, chunked byte-message
// pipes between two endpoints.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tracing::debug;

use crate::client::relay::RelayWriter;
use crate::error::{Error, Result};
use crate::handlers::ServiceHandler;

/// Initial data allowance granted to the remote endpoint of every tunnel.
const DEFAULT_TUNNEL_BUFFER: u64 = 64 * 1024 * 1024;

pub(crate) struct TunnelScheme {
    inner: Arc<SchemeInner>,
}

struct SchemeInner {
    writer: Arc<RelayWriter>,
    next_id: AtomicU64,
    // Build results for tunnels under construction, keyed by local id. A
    // confirmed chunk limit of zero signals a construction timeout.
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<u64>>>>,
    // Live endpoints, keyed by local id.
    active: Mutex<HashMap<u64, Arc<TunnelState>>>,
}

// Deregisters a failed build on every exit path, including caller
// cancellation; a successful build keeps the active entry.
struct BuildGuard<'a> {
    inner: &'a SchemeInner,
    id: u64,
    built: bool,
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().expect("pending lock").remove(&self.id);
        if !self.built {
            self.inner.active.lock().expect("active lock").remove(&self.id);
        }
    }
}

impl TunnelScheme {
    pub(crate) fn new(writer: Arc<RelayWriter>) -> Self {
        Self {
            inner: Arc::new(SchemeInner {
                writer,
                next_id: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Relays a tunnel construction request and waits for the peer to be
    /// matched, or for the relay-enforced timeout.
    pub(crate) async fn open(&self, cluster: &str, timeout_ms: u64) -> Result<Tunnel> {
        let inner = &*self.inner;
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (build_tx, build_rx) = oneshot::channel();
        inner.pending.lock().expect("pending lock").insert(id, build_tx);

        // The endpoint must exist before the init frame goes out: the relay
        // may grant an allowance before the confirmation is observed, and a
        // late registration would race the reader.
        let state = Arc::new(TunnelState::new(id, Arc::clone(&inner.writer), 0));
        inner
            .active
            .lock()
            .expect("active lock")
            .insert(id, Arc::clone(&state));
        let mut guard = BuildGuard {
            inner,
            id,
            built: false,
        };

        inner.writer.send_tunnel_init(id, cluster, timeout_ms).await?;
        let chunk_limit = build_rx.await.map_err(|_| Error::Closed)??;
        if chunk_limit == 0 {
            return Err(Error::Timeout);
        }
        state.chunk_limit.store(chunk_limit as usize, Ordering::Release);
        inner.writer.send_tunnel_allowance(id, DEFAULT_TUNNEL_BUFFER).await?;
        guard.built = true;
        Ok(Tunnel { state })
    }

    /// Opens the local endpoint for a relay-offered tunnel: confirm, grant
    /// the initial allowance, then hand the endpoint to the service handler
    /// on a fresh task.
    pub(crate) fn handle_init(
        &self,
        handler: Option<&Arc<dyn ServiceHandler>>,
        init_id: u64,
        chunk_limit: u64,
    ) {
        let Some(handler) = handler else {
            debug!(init_id, "tunnel offer for a pure client connection dropped");
            return;
        };
        if chunk_limit == 0 {
            debug!(init_id, "tunnel offer without a chunk limit dropped");
            return;
        }
        let handler = Arc::clone(handler);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let id = inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            let state = Arc::new(TunnelState::new(
                id,
                Arc::clone(&inner.writer),
                chunk_limit as usize,
            ));
            inner
                .active
                .lock()
                .expect("active lock")
                .insert(id, Arc::clone(&state));

            let confirmed = async {
                inner.writer.send_tunnel_confirm(init_id, id).await?;
                inner.writer.send_tunnel_allowance(id, DEFAULT_TUNNEL_BUFFER).await
            }
            .await;
            match confirmed {
                Ok(()) => handler.handle_tunnel(Tunnel { state }).await,
                Err(err) => {
                    debug!(id, error = %err, "tunnel confirmation failed");
                    inner.active.lock().expect("active lock").remove(&id);
                }
            }
        });
    }

    /// Forwards the construction result to the waiting builder.
    pub(crate) fn complete_build(&self, id: u64, chunk_limit: u64) {
        if let Some(build_tx) = self.inner.pending.lock().expect("pending lock").remove(&id) {
            let _ = build_tx.send(Ok(chunk_limit));
        }
    }

    pub(crate) fn handle_allowance(&self, id: u64, space: u64) {
        let state = self.inner.active.lock().expect("active lock").get(&id).cloned();
        if let Some(state) = state {
            state.grant(space);
        }
    }

    pub(crate) fn handle_transfer(&self, id: u64, size_or_cont: u64, chunk: Bytes) {
        let state = self.inner.active.lock().expect("active lock").get(&id).cloned();
        if let Some(state) = state {
            state.ingest(size_or_cont, &chunk);
        }
    }

    pub(crate) fn handle_close(&self, id: u64, reason: String) {
        let state = self.inner.active.lock().expect("active lock").remove(&id);
        if let Some(state) = state {
            state.mark_closed(reason);
        }
    }

    /// Fails pending builds and terminates live endpoints when the
    /// connection goes down.
    pub(crate) fn fail_all(&self, err: &Error) {
        for (_, build_tx) in self.inner.pending.lock().expect("pending lock").drain() {
            let _ = build_tx.send(Err(err.fan_out()));
        }
        for (_, state) in self.inner.active.lock().expect("active lock").drain() {
            state.mark_closed(format!("connection terminated: {err}"));
        }
    }
}

/// One endpoint of an established tunnel.
///
/// Sends are throttled by the allowance granted by the peer; receives
/// replenish that allowance as messages are consumed. Messages are chunked
/// to the peer-advertised limit on the wire and reassembled before delivery.
pub struct Tunnel {
    state: Arc<TunnelState>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel").finish_non_exhaustive()
    }
}

struct TunnelState {
    id: u64,
    writer: Arc<RelayWriter>,
    // Maximum chunk payload, advertised by the relay during construction.
    chunk_limit: AtomicUsize,
    // Serialises concurrent send calls so chunk sequences never interleave.
    send_serial: tokio::sync::Mutex<()>,
    // Space allowance granted by the peer.
    credit: Mutex<u64>,
    credit_granted: Notify,
    // Fully reassembled inbound messages.
    inbound: Mutex<VecDeque<Bytes>>,
    arrived: Notify,
    // Message under reassembly; only the reader task touches it.
    assembly: Mutex<Assembly>,
    exit: Mutex<ExitState>,
    closed: Notify,
}

struct Assembly {
    buffer: BytesMut,
    capacity: usize,
}

#[derive(Default)]
struct ExitState {
    status: Option<String>,
    requested: bool,
}

impl TunnelState {
    fn new(id: u64, writer: Arc<RelayWriter>, chunk_limit: usize) -> Self {
        Self {
            id,
            writer,
            chunk_limit: AtomicUsize::new(chunk_limit),
            send_serial: tokio::sync::Mutex::new(()),
            credit: Mutex::new(0),
            credit_granted: Notify::new(),
            inbound: Mutex::new(VecDeque::new()),
            arrived: Notify::new(),
            assembly: Mutex::new(Assembly {
                buffer: BytesMut::new(),
                capacity: 0,
            }),
            exit: Mutex::new(ExitState::default()),
            closed: Notify::new(),
        }
    }

    fn grant(&self, space: u64) {
        {
            let mut credit = self.credit.lock().expect("credit lock");
            *credit = credit.saturating_add(space);
        }
        self.credit_granted.notify_waiters();
    }

    async fn await_credit(&self, need: u64, deadline: Option<Instant>) -> Result<()> {
        loop {
            let granted = self.credit_granted.notified();
            {
                let mut credit = self.credit.lock().expect("credit lock");
                if *credit >= need {
                    *credit -= need;
                    return Ok(());
                }
            }
            if let Some(err) = self.exit_error() {
                return Err(err);
            }
            wait(granted, deadline).await?;
        }
    }

    fn ingest(&self, size_or_cont: u64, chunk: &[u8]) {
        let completed = {
            let mut assembly = self.assembly.lock().expect("assembly lock");
            if size_or_cont != 0 {
                if !assembly.buffer.is_empty() {
                    // A long-running transfer was abandoned mid-message
                    // (e.g. a timed-out send); refund the partial bytes to
                    // the peer, off the reader path.
                    let refund = assembly.buffer.len() as u64;
                    let writer = Arc::clone(&self.writer);
                    let id = self.id;
                    tokio::spawn(async move {
                        if let Err(err) = writer.send_tunnel_allowance(id, refund).await {
                            debug!(id, error = %err, "partial-message refund failed");
                        }
                    });
                }
                assembly.capacity = size_or_cont as usize;
                assembly.buffer = BytesMut::with_capacity(assembly.capacity);
            }
            if assembly.capacity == 0 {
                debug!(id = self.id, "tunnel chunk without a message start dropped");
                return;
            }
            assembly.buffer.extend_from_slice(chunk);
            if assembly.buffer.len() >= assembly.capacity {
                assembly.capacity = 0;
                Some(std::mem::take(&mut assembly.buffer).freeze())
            } else {
                None
            }
        };
        if let Some(message) = completed {
            self.inbound.lock().expect("inbound lock").push_back(message);
            self.arrived.notify_waiters();
        }
    }

    fn mark_closed(&self, reason: String) {
        {
            let mut exit = self.exit.lock().expect("exit lock");
            if exit.status.is_some() {
                return;
            }
            exit.status = Some(reason);
        }
        self.closed.notify_waiters();
        // Senders blocked on credit and receivers blocked on the queue must
        // observe the closure.
        self.credit_granted.notify_waiters();
        self.arrived.notify_waiters();
    }

    fn exit_error(&self) -> Option<Error> {
        let exit = self.exit.lock().expect("exit lock");
        exit.status.as_ref().map(|reason| {
            if reason.is_empty() {
                Error::Closed
            } else {
                Error::RemoteClose(reason.clone())
            }
        })
    }
}

async fn wait(notified: Notified<'_>, deadline: Option<Instant>) -> Result<()> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, notified)
            .await
            .map_err(|_| Error::Timeout),
        None => {
            notified.await;
            Ok(())
        }
    }
}

impl Tunnel {
    /// Sends a message to the remote endpoint, blocking until the local
    /// relay accepts all of it or the deadline passes. A timeout of zero
    /// blocks indefinitely.
    pub async fn send(&self, message: &[u8], timeout_ms: u64) -> Result<()> {
        if message.is_empty() {
            // A transfer's first chunk is flagged by a non-zero total size,
            // so zero-length messages have no wire representation.
            return Err(Error::InvalidArgument("empty tunnel message".into()));
        }
        let state = &self.state;
        let deadline =
            (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
        let _serial = state.send_serial.lock().await;
        if let Some(err) = state.exit_error() {
            return Err(err);
        }

        let chunk_limit = state.chunk_limit.load(Ordering::Acquire);
        if chunk_limit == 0 {
            return Err(Error::Protocol("tunnel chunk limit not negotiated".into()));
        }
        let mut pos = 0;
        while pos < message.len() {
            let end = (pos + chunk_limit).min(message.len());
            // The first chunk carries the total message size, continuations
            // carry zero.
            let size_or_cont = if pos == 0 { message.len() as u64 } else { 0 };
            let chunk = &message[pos..end];

            state.await_credit(chunk.len() as u64, deadline).await?;
            state
                .writer
                .send_tunnel_transfer(state.id, size_or_cont, chunk)
                .await?;
            pos = end;
        }
        Ok(())
    }

    /// Retrieves the next message, blocking until one is available or the
    /// deadline passes. A timeout of zero blocks indefinitely.
    pub async fn receive(&self, timeout_ms: u64) -> Result<Bytes> {
        let state = &self.state;
        let deadline =
            (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
        loop {
            let arrived = state.arrived.notified();
            {
                let mut inbound = state.inbound.lock().expect("inbound lock");
                if let Some(message) = inbound.pop_front() {
                    drop(inbound);
                    // Replenish the peer's allowance off the queue lock and
                    // off the reader path.
                    let writer = Arc::clone(&state.writer);
                    let id = state.id;
                    let space = message.len() as u64;
                    tokio::spawn(async move {
                        if let Err(err) = writer.send_tunnel_allowance(id, space).await {
                            debug!(id, error = %err, "allowance replenish failed");
                        }
                    });
                    return Ok(message);
                }
            }
            // Buffered messages drain even after closure; an empty queue on
            // a closed tunnel is terminal.
            if let Some(err) = state.exit_error() {
                return Err(err);
            }
            wait(arrived, deadline).await?;
        }
    }

    /// Gracefully tears the tunnel down, waiting for the peer's
    /// acknowledgement. Fails with the peer's reason if the closure was not
    /// clean.
    pub async fn close(&self) -> Result<()> {
        let state = &self.state;
        let request = {
            let mut exit = state.exit.lock().expect("exit lock");
            exit.status.is_none() && !std::mem::replace(&mut exit.requested, true)
        };
        if request {
            state.writer.send_tunnel_close(state.id).await?;
        }
        loop {
            let closed = state.closed.notified();
            {
                let exit = state.exit.lock().expect("exit lock");
                if let Some(status) = exit.status.as_ref() {
                    return if status.is_empty() {
                        Ok(())
                    } else {
                        Err(Error::RemoteClose(status.clone()))
                    };
                }
            }
            closed.await;
        }
    }
}
