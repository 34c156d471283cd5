// In-process mock relay used by the integration suites.
//
// The relay is a single router task owning all fabric state, fed by
// per-connection reader tasks and writing through per-connection outbound
// queues. It implements just enough of the relay contract for the binding:
// init/ack, cluster membership, broadcast fan-out, request forwarding with
// relay-side timeouts, topic fan-out, tunnel pairing with fresh per-side
// ids, and the close acknowledgement.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use bytes::{Bytes, BytesMut};
use iris_wire::{self as wire, OpCode};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Chunk limit the relay advertises for every tunnel; deliberately small so
/// modest test messages exercise chunking.
pub const CHUNK_LIMIT: u64 = 256;

/// Registrations for this cluster name are refused during the handshake.
pub const REFUSED_CLUSTER: &str = "forbidden";

/// Members of this cluster get their close acknowledged with a non-empty
/// reason, as a relay shedding connections would.
pub const DRAINING_CLUSTER: &str = "draining";

/// Reason carried by the close acknowledgement for [`DRAINING_CLUSTER`].
pub const DRAINING_REASON: &str = "relay draining";

pub struct LocalRelay {
    pub port: u16,
}

impl LocalRelay {
    pub async fn spawn() -> Result<LocalRelay> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let (router_tx, router_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_router(router_rx, router_tx.clone()));
        tokio::spawn(async move {
            let mut next_peer = 0u64;
            while let Ok((stream, _)) = listener.accept().await {
                next_peer += 1;
                let router = router_tx.clone();
                let peer = next_peer;
                tokio::spawn(async move {
                    if let Err(err) = run_connection(stream, peer, router).await {
                        // Dropped connections are routine during teardown.
                        let _ = err;
                    }
                });
            }
        });
        Ok(LocalRelay { port })
    }
}

enum Event {
    Connected {
        peer: u64,
        cluster: String,
        out: mpsc::UnboundedSender<Bytes>,
    },
    Frame {
        peer: u64,
        frame: ClientFrame,
    },
    Disconnected {
        peer: u64,
    },
    RequestExpired {
        rid: u64,
    },
    BuildExpired {
        binit: u64,
    },
}

enum ClientFrame {
    Broadcast {
        cluster: String,
        message: Bytes,
    },
    Request {
        id: u64,
        cluster: String,
        body: Bytes,
        timeout_ms: u64,
    },
    Reply {
        id: u64,
        success: bool,
        reply: Bytes,
        error: String,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Publish {
        topic: String,
        event: Bytes,
    },
    TunInit {
        id: u64,
        cluster: String,
        timeout_ms: u64,
    },
    TunConfirm {
        init_id: u64,
        tun_id: u64,
    },
    TunAllow {
        id: u64,
        space: u64,
    },
    TunTransfer {
        id: u64,
        size_or_cont: u64,
        chunk: Bytes,
    },
    TunClose {
        id: u64,
    },
    Close,
}

async fn run_connection(
    stream: TcpStream,
    peer: u64,
    router: mpsc::UnboundedSender<Event>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    ensure!(
        wire::read_op(&mut reader).await? == OpCode::Init,
        "expected init"
    );
    let magic = wire::read_string(&mut reader).await?;
    let cluster = wire::read_string(&mut reader).await?;
    if magic != wire::MAGIC {
        write_half
            .write_all(&frames::init_ack_err("unknown protocol magic"))
            .await?;
        return Ok(());
    }
    if cluster == REFUSED_CLUSTER {
        write_half
            .write_all(&frames::init_ack_err("cluster registration refused"))
            .await?;
        return Ok(());
    }

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
            let _ = write_half.flush().await;
        }
        let _ = write_half.shutdown().await;
    });

    // The router acks the handshake, so registration is ordered before any
    // frame this connection produces afterwards.
    router
        .send(Event::Connected {
            peer,
            cluster,
            out: out_tx,
        })
        .ok()
        .context("router gone")?;

    loop {
        let op = match wire::read_op(&mut reader).await {
            Ok(op) => op,
            Err(_) => {
                let _ = router.send(Event::Disconnected { peer });
                return Ok(());
            }
        };
        let frame = parse_frame(op, &mut reader).await?;
        let closing = matches!(frame, ClientFrame::Close);
        router
            .send(Event::Frame { peer, frame })
            .ok()
            .context("router gone")?;
        if closing {
            return Ok(());
        }
    }
}

async fn parse_frame(op: OpCode, reader: &mut BufReader<OwnedReadHalf>) -> Result<ClientFrame> {
    Ok(match op {
        OpCode::Broadcast => ClientFrame::Broadcast {
            cluster: wire::read_string(reader).await?,
            message: wire::read_binary(reader).await?,
        },
        OpCode::Request => ClientFrame::Request {
            id: wire::read_varint(reader).await?,
            cluster: wire::read_string(reader).await?,
            body: wire::read_binary(reader).await?,
            timeout_ms: wire::read_varint(reader).await?,
        },
        OpCode::Reply => {
            let id = wire::read_varint(reader).await?;
            let _timeout = wire::read_bool(reader).await?;
            let success = wire::read_bool(reader).await?;
            let (reply, error) = if success {
                (wire::read_binary(reader).await?, String::new())
            } else {
                (Bytes::new(), wire::read_string(reader).await?)
            };
            ClientFrame::Reply {
                id,
                success,
                reply,
                error,
            }
        }
        OpCode::Subscribe => ClientFrame::Subscribe {
            topic: wire::read_string(reader).await?,
        },
        OpCode::Unsubscribe => ClientFrame::Unsubscribe {
            topic: wire::read_string(reader).await?,
        },
        OpCode::Publish => ClientFrame::Publish {
            topic: wire::read_string(reader).await?,
            event: wire::read_binary(reader).await?,
        },
        OpCode::TunInit => ClientFrame::TunInit {
            id: wire::read_varint(reader).await?,
            cluster: wire::read_string(reader).await?,
            timeout_ms: wire::read_varint(reader).await?,
        },
        OpCode::TunConfirm => ClientFrame::TunConfirm {
            init_id: wire::read_varint(reader).await?,
            tun_id: wire::read_varint(reader).await?,
        },
        OpCode::TunAllow => ClientFrame::TunAllow {
            id: wire::read_varint(reader).await?,
            space: wire::read_varint(reader).await?,
        },
        OpCode::TunTransfer => ClientFrame::TunTransfer {
            id: wire::read_varint(reader).await?,
            size_or_cont: wire::read_varint(reader).await?,
            chunk: wire::read_binary(reader).await?,
        },
        OpCode::TunClose => {
            let id = wire::read_varint(reader).await?;
            let _reason = wire::read_string(reader).await?;
            ClientFrame::TunClose { id }
        }
        OpCode::Close => {
            let _reason = wire::read_string(reader).await?;
            ClientFrame::Close
        }
        other => bail!("unexpected client opcode {other:?}"),
    })
}

struct Peer {
    cluster: String,
    out: mpsc::UnboundedSender<Bytes>,
}

#[derive(Default)]
struct RouterState {
    peers: HashMap<u64, Peer>,
    clusters: HashMap<String, Vec<u64>>,
    topics: HashMap<String, HashSet<u64>>,
    round_robin: HashMap<String, usize>,
    // Forwarded requests: relay-side id -> (origin peer, origin id).
    requests: HashMap<u64, (u64, u64)>,
    next_rid: u64,
    // Tunnel builds in flight: relay-side init id -> (origin peer, origin id).
    builds: HashMap<u64, (u64, u64)>,
    next_binit: u64,
    // Established tunnels, linked in both directions.
    links: HashMap<(u64, u64), (u64, u64)>,
}

impl RouterState {
    fn deliver(&self, peer: u64, frame: Bytes) {
        if let Some(entry) = self.peers.get(&peer) {
            let _ = entry.out.send(frame);
        }
    }

    fn pick_member(&mut self, cluster: &str) -> Option<u64> {
        let members = self.clusters.get(cluster)?;
        if members.is_empty() {
            return None;
        }
        let slot = self.round_robin.entry(cluster.to_string()).or_insert(0);
        let member = members[*slot % members.len()];
        *slot += 1;
        Some(member)
    }

    fn drop_peer(&mut self, peer: u64) {
        if let Some(entry) = self.peers.remove(&peer) {
            if let Some(members) = self.clusters.get_mut(&entry.cluster) {
                members.retain(|member| *member != peer);
            }
        }
        for subscribers in self.topics.values_mut() {
            subscribers.remove(&peer);
        }
        self.requests.retain(|_, (origin, _)| *origin != peer);
        self.builds.retain(|_, (origin, _)| *origin != peer);

        // Partners of the peer's tunnels observe a clean closure.
        let severed: Vec<_> = self
            .links
            .keys()
            .filter(|(owner, _)| *owner == peer)
            .copied()
            .collect();
        for key in severed {
            if let Some((partner, partner_id)) = self.links.remove(&key) {
                self.links.remove(&(partner, partner_id));
                self.deliver(partner, frames::tun_close(partner_id, ""));
            }
        }
    }
}

async fn run_router(
    mut rx: mpsc::UnboundedReceiver<Event>,
    tx: mpsc::UnboundedSender<Event>,
) {
    let mut state = RouterState::default();
    while let Some(event) = rx.recv().await {
        match event {
            Event::Connected { peer, cluster, out } => {
                let _ = out.send(frames::init_ack_ok());
                if !cluster.is_empty() {
                    state.clusters.entry(cluster.clone()).or_default().push(peer);
                }
                state.peers.insert(peer, Peer { cluster, out });
            }
            Event::Disconnected { peer } => state.drop_peer(peer),
            Event::RequestExpired { rid } => {
                if let Some((origin, id)) = state.requests.remove(&rid) {
                    state.deliver(origin, frames::reply_timeout(id));
                }
            }
            Event::BuildExpired { binit } => {
                if let Some((origin, id)) = state.builds.remove(&binit) {
                    state.deliver(origin, frames::tun_confirm(id, 0));
                }
            }
            Event::Frame { peer, frame } => handle_frame(&mut state, &tx, peer, frame),
        }
    }
}

fn handle_frame(
    state: &mut RouterState,
    tx: &mpsc::UnboundedSender<Event>,
    peer: u64,
    frame: ClientFrame,
) {
    match frame {
        ClientFrame::Broadcast { cluster, message } => {
            let members = state.clusters.get(&cluster).cloned().unwrap_or_default();
            for member in members {
                state.deliver(member, frames::broadcast(&message));
            }
        }
        ClientFrame::Request {
            id,
            cluster,
            body,
            timeout_ms,
        } => {
            state.next_rid += 1;
            let rid = state.next_rid;
            state.requests.insert(rid, (peer, id));
            if let Some(member) = state.pick_member(&cluster) {
                state.deliver(member, frames::request(rid, &body, timeout_ms));
            }
            if timeout_ms > 0 {
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                    let _ = tx.send(Event::RequestExpired { rid });
                });
            } else if !state.clusters.contains_key(&cluster) {
                let _ = tx.send(Event::RequestExpired { rid });
            }
        }
        ClientFrame::Reply {
            id: rid,
            success,
            reply,
            error,
        } => {
            if let Some((origin, id)) = state.requests.remove(&rid) {
                state.deliver(origin, frames::reply(id, success, &reply, &error));
            }
        }
        ClientFrame::Subscribe { topic } => {
            state.topics.entry(topic).or_default().insert(peer);
        }
        ClientFrame::Unsubscribe { topic } => {
            if let Some(subscribers) = state.topics.get_mut(&topic) {
                subscribers.remove(&peer);
            }
        }
        ClientFrame::Publish { topic, event } => {
            let subscribers = state.topics.get(&topic).cloned().unwrap_or_default();
            for subscriber in subscribers {
                state.deliver(subscriber, frames::publish(&topic, &event));
            }
        }
        ClientFrame::TunInit {
            id,
            cluster,
            timeout_ms,
        } => {
            state.next_binit += 1;
            let binit = state.next_binit;
            state.builds.insert(binit, (peer, id));
            if let Some(member) = state.pick_member(&cluster) {
                state.deliver(member, frames::tun_init(binit, CHUNK_LIMIT));
            }
            if timeout_ms > 0 {
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                    let _ = tx.send(Event::BuildExpired { binit });
                });
            }
        }
        ClientFrame::TunConfirm { init_id, tun_id } => {
            if let Some((origin, origin_id)) = state.builds.remove(&init_id) {
                state.links.insert((origin, origin_id), (peer, tun_id));
                state.links.insert((peer, tun_id), (origin, origin_id));
                state.deliver(origin, frames::tun_confirm(origin_id, CHUNK_LIMIT));
            }
        }
        ClientFrame::TunAllow { id, space } => {
            if let Some((partner, partner_id)) = state.links.get(&(peer, id)).copied() {
                state.deliver(partner, frames::tun_allow(partner_id, space));
            }
        }
        ClientFrame::TunTransfer {
            id,
            size_or_cont,
            chunk,
        } => {
            if let Some((partner, partner_id)) = state.links.get(&(peer, id)).copied() {
                state.deliver(partner, frames::tun_transfer(partner_id, size_or_cont, &chunk));
            }
        }
        ClientFrame::TunClose { id } => {
            if let Some((partner, partner_id)) = state.links.remove(&(peer, id)) {
                state.links.remove(&(partner, partner_id));
                state.deliver(peer, frames::tun_close(id, ""));
                state.deliver(partner, frames::tun_close(partner_id, ""));
            }
        }
        ClientFrame::Close => {
            let reason = match state.peers.get(&peer) {
                Some(entry) if entry.cluster == DRAINING_CLUSTER => DRAINING_REASON,
                _ => "",
            };
            state.deliver(peer, frames::close(reason));
            state.drop_peer(peer);
        }
    }
}

pub mod frames {
    use super::*;

    fn build<F: FnOnce(&mut BytesMut)>(op: OpCode, fill: F) -> Bytes {
        let mut buf = BytesMut::new();
        wire::put_op(&mut buf, op);
        fill(&mut buf);
        buf.freeze()
    }

    pub fn init_ack_ok() -> Bytes {
        build(OpCode::InitAck, |buf| wire::put_bool(buf, true))
    }

    pub fn init_ack_err(reason: &str) -> Bytes {
        build(OpCode::InitAck, |buf| {
            wire::put_bool(buf, false);
            wire::put_string(buf, reason);
        })
    }

    pub fn broadcast(message: &[u8]) -> Bytes {
        build(OpCode::Broadcast, |buf| wire::put_binary(buf, message))
    }

    pub fn request(id: u64, body: &[u8], timeout_ms: u64) -> Bytes {
        build(OpCode::Request, |buf| {
            wire::put_varint(buf, id);
            wire::put_binary(buf, body);
            wire::put_varint(buf, timeout_ms);
        })
    }

    pub fn reply_timeout(id: u64) -> Bytes {
        build(OpCode::Reply, |buf| {
            wire::put_varint(buf, id);
            wire::put_bool(buf, true);
        })
    }

    pub fn reply(id: u64, success: bool, payload: &[u8], error: &str) -> Bytes {
        build(OpCode::Reply, |buf| {
            wire::put_varint(buf, id);
            wire::put_bool(buf, false);
            wire::put_bool(buf, success);
            if success {
                wire::put_binary(buf, payload);
            } else {
                wire::put_string(buf, error);
            }
        })
    }

    pub fn publish(topic: &str, event: &[u8]) -> Bytes {
        build(OpCode::Publish, |buf| {
            wire::put_string(buf, topic);
            wire::put_binary(buf, event);
        })
    }

    pub fn tun_init(init_id: u64, chunk_limit: u64) -> Bytes {
        build(OpCode::TunInit, |buf| {
            wire::put_varint(buf, init_id);
            wire::put_varint(buf, chunk_limit);
        })
    }

    pub fn tun_confirm(id: u64, chunk_limit: u64) -> Bytes {
        build(OpCode::TunConfirm, |buf| {
            wire::put_varint(buf, id);
            wire::put_varint(buf, chunk_limit);
        })
    }

    pub fn tun_allow(id: u64, space: u64) -> Bytes {
        build(OpCode::TunAllow, |buf| {
            wire::put_varint(buf, id);
            wire::put_varint(buf, space);
        })
    }

    pub fn tun_transfer(id: u64, size_or_cont: u64, chunk: &[u8]) -> Bytes {
        build(OpCode::TunTransfer, |buf| {
            wire::put_varint(buf, id);
            wire::put_varint(buf, size_or_cont);
            wire::put_binary(buf, chunk);
        })
    }

    pub fn tun_close(id: u64, reason: &str) -> Bytes {
        build(OpCode::TunClose, |buf| {
            wire::put_varint(buf, id);
            wire::put_string(buf, reason);
        })
    }

    pub fn close(reason: &str) -> Bytes {
        build(OpCode::Close, |buf| wire::put_string(buf, reason))
    }
}
