// Relay protocol driver: init handshake, single-writer frame emission, and
// the inbound opcode dispatch loop.
use std::sync::Arc;

use bytes::BytesMut;
use iris_wire::{self as wire, OpCode};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tracing::debug;

use crate::client::connection::Core;
use crate::error::{Error, Result};
use crate::handlers::ServiceHandler;

pub(crate) type RelayReader = BufReader<OwnedReadHalf>;

type BoxedSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of the relay connection. Every frame is serialised into the
/// scratch buffer and written atomically under the mutex, ended by a flush,
/// so concurrent callers never interleave frame bytes.
pub(crate) struct RelayWriter {
    sink: tokio::sync::Mutex<Option<SinkState>>,
}

struct SinkState {
    stream: BoxedSink,
    scratch: BytesMut,
}

impl RelayWriter {
    pub(crate) fn new(stream: BoxedSink) -> Self {
        Self {
            sink: tokio::sync::Mutex::new(Some(SinkState {
                stream,
                scratch: BytesMut::with_capacity(4 * 1024),
            })),
        }
    }

    async fn send_frame<F>(&self, op: OpCode, build: F) -> Result<()>
    where
        F: FnOnce(&mut BytesMut),
    {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(Error::Closed)?;
        sink.scratch.clear();
        wire::put_op(&mut sink.scratch, op);
        build(&mut sink.scratch);
        sink.stream.write_all(&sink.scratch).await?;
        sink.stream.flush().await?;
        Ok(())
    }

    pub(crate) async fn send_init(&self, cluster: &str) -> Result<()> {
        self.send_frame(OpCode::Init, |buf| {
            wire::put_string(buf, wire::MAGIC);
            wire::put_string(buf, cluster);
        })
        .await
    }

    pub(crate) async fn send_broadcast(&self, cluster: &str, message: &[u8]) -> Result<()> {
        self.send_frame(OpCode::Broadcast, |buf| {
            wire::put_string(buf, cluster);
            wire::put_binary(buf, message);
        })
        .await
    }

    pub(crate) async fn send_request(
        &self,
        id: u64,
        cluster: &str,
        body: &[u8],
        timeout_ms: u64,
    ) -> Result<()> {
        self.send_frame(OpCode::Request, |buf| {
            wire::put_varint(buf, id);
            wire::put_string(buf, cluster);
            wire::put_binary(buf, body);
            wire::put_varint(buf, timeout_ms);
        })
        .await
    }

    pub(crate) async fn send_reply_success(&self, id: u64, reply: &[u8]) -> Result<()> {
        self.send_frame(OpCode::Reply, |buf| {
            wire::put_varint(buf, id);
            wire::put_bool(buf, false);
            wire::put_bool(buf, true);
            wire::put_binary(buf, reply);
        })
        .await
    }

    pub(crate) async fn send_reply_failure(&self, id: u64, error: &str) -> Result<()> {
        self.send_frame(OpCode::Reply, |buf| {
            wire::put_varint(buf, id);
            wire::put_bool(buf, false);
            wire::put_bool(buf, false);
            wire::put_string(buf, error);
        })
        .await
    }

    pub(crate) async fn send_subscribe(&self, topic: &str) -> Result<()> {
        self.send_frame(OpCode::Subscribe, |buf| wire::put_string(buf, topic))
            .await
    }

    pub(crate) async fn send_unsubscribe(&self, topic: &str) -> Result<()> {
        self.send_frame(OpCode::Unsubscribe, |buf| wire::put_string(buf, topic))
            .await
    }

    pub(crate) async fn send_publish(&self, topic: &str, event: &[u8]) -> Result<()> {
        self.send_frame(OpCode::Publish, |buf| {
            wire::put_string(buf, topic);
            wire::put_binary(buf, event);
        })
        .await
    }

    pub(crate) async fn send_tunnel_init(
        &self,
        id: u64,
        cluster: &str,
        timeout_ms: u64,
    ) -> Result<()> {
        self.send_frame(OpCode::TunInit, |buf| {
            wire::put_varint(buf, id);
            wire::put_string(buf, cluster);
            wire::put_varint(buf, timeout_ms);
        })
        .await
    }

    pub(crate) async fn send_tunnel_confirm(&self, init_id: u64, tun_id: u64) -> Result<()> {
        self.send_frame(OpCode::TunConfirm, |buf| {
            wire::put_varint(buf, init_id);
            wire::put_varint(buf, tun_id);
        })
        .await
    }

    pub(crate) async fn send_tunnel_allowance(&self, id: u64, space: u64) -> Result<()> {
        self.send_frame(OpCode::TunAllow, |buf| {
            wire::put_varint(buf, id);
            wire::put_varint(buf, space);
        })
        .await
    }

    pub(crate) async fn send_tunnel_transfer(
        &self,
        id: u64,
        size_or_cont: u64,
        chunk: &[u8],
    ) -> Result<()> {
        self.send_frame(OpCode::TunTransfer, |buf| {
            wire::put_varint(buf, id);
            wire::put_varint(buf, size_or_cont);
            wire::put_binary(buf, chunk);
        })
        .await
    }

    pub(crate) async fn send_tunnel_close(&self, id: u64) -> Result<()> {
        self.send_frame(OpCode::TunClose, |buf| {
            wire::put_varint(buf, id);
            wire::put_string(buf, "");
        })
        .await
    }

    pub(crate) async fn send_close(&self) -> Result<()> {
        self.send_frame(OpCode::Close, |buf| wire::put_string(buf, "")).await
    }

    /// Drops the write half; later sends fail with `Closed`.
    pub(crate) async fn shutdown(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.stream.shutdown().await;
        }
    }
}

/// Dials the local relay and runs the init handshake.
pub(crate) async fn connect_relay(
    port: u16,
    cluster: &str,
) -> Result<(RelayReader, Arc<RelayWriter>)> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await?;
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    let writer = Arc::new(RelayWriter::new(Box::new(write_half)));
    let mut reader = BufReader::new(read_half);

    writer.send_init(cluster).await?;
    match wire::read_op(&mut reader).await? {
        OpCode::InitAck => {
            if wire::read_bool(&mut reader).await? {
                Ok((reader, writer))
            } else {
                Err(Error::Init(wire::read_string(&mut reader).await?))
            }
        }
        other => Err(Error::Protocol(format!(
            "unexpected opcode {other:?} during handshake"
        ))),
    }
}

/// Reader task body: drives the dispatch loop and fans any terminal outcome
/// out to the pending operations. The task owns the only handler reference
/// held by the connection core, so its exit also releases the handler.
pub(crate) async fn run_reader(
    core: Arc<Core>,
    handler: Option<Arc<dyn ServiceHandler>>,
    mut reader: RelayReader,
) {
    let outcome = dispatch_loop(&core, handler.as_ref(), &mut reader).await;
    if let Err(err) = &outcome {
        debug!(error = %err, "relay reader terminated");
    }
    core.finish(outcome);
}

async fn dispatch_loop(
    core: &Core,
    handler: Option<&Arc<dyn ServiceHandler>>,
    reader: &mut RelayReader,
) -> Result<String> {
    loop {
        match wire::read_op(reader).await? {
            OpCode::Broadcast => {
                let message = wire::read_binary(reader).await?;
                core.broadcast.dispatch(handler, message).await;
            }
            OpCode::Request => {
                let id = wire::read_varint(reader).await?;
                let body = wire::read_binary(reader).await?;
                let timeout_ms = wire::read_varint(reader).await?;
                core.request.dispatch(handler, id, body, timeout_ms).await;
            }
            OpCode::Reply => {
                let id = wire::read_varint(reader).await?;
                let outcome = if wire::read_bool(reader).await? {
                    Err(Error::Timeout)
                } else if wire::read_bool(reader).await? {
                    Ok(wire::read_binary(reader).await?)
                } else {
                    Err(Error::Remote(wire::read_string(reader).await?))
                };
                core.request.complete(id, outcome);
            }
            OpCode::Publish => {
                let topic = wire::read_string(reader).await?;
                let event = wire::read_binary(reader).await?;
                core.publish.dispatch(&topic, event).await;
            }
            OpCode::TunInit => {
                let init_id = wire::read_varint(reader).await?;
                let chunk_limit = wire::read_varint(reader).await?;
                core.tunnel.handle_init(handler, init_id, chunk_limit);
            }
            OpCode::TunConfirm => {
                let id = wire::read_varint(reader).await?;
                let chunk_limit = wire::read_varint(reader).await?;
                core.tunnel.complete_build(id, chunk_limit);
            }
            OpCode::TunAllow => {
                let id = wire::read_varint(reader).await?;
                let space = wire::read_varint(reader).await?;
                core.tunnel.handle_allowance(id, space);
            }
            OpCode::TunTransfer => {
                let id = wire::read_varint(reader).await?;
                let size_or_cont = wire::read_varint(reader).await?;
                let chunk = wire::read_binary(reader).await?;
                core.tunnel.handle_transfer(id, size_or_cont, chunk);
            }
            OpCode::TunClose => {
                let id = wire::read_varint(reader).await?;
                let reason = wire::read_string(reader).await?;
                core.tunnel.handle_close(id, reason);
            }
            OpCode::Close => {
                return Ok(wire::read_string(reader).await?);
            }
            // Outbound-only (or handshake-only) opcodes must never arrive
            // mid-session.
            op @ (OpCode::Init | OpCode::InitAck | OpCode::Subscribe | OpCode::Unsubscribe) => {
                return Err(Error::Protocol(format!("unexpected inbound opcode {op:?}")));
            }
        }
    }
}
