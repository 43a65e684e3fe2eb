//! Relay runtime: sits on one path between client and server and converts
//! the transport of that path.
//!
//! Every inbound TCP connection or UDP session is paired with its own
//! forward link to `remote_addr`. Both sides of a pair share one token, so
//! either side failing tears the whole pair down. Frames are passed through
//! untouched; only their batching changes.

use crate::runtime::LogFn;
use anyhow::{Context, Result};
use mptun_core::buffer::{BufferHandle, BufferPool};
use mptun_core::control::{resolve_addr, EngineConfig, RelayConfig, TransportKind};
use mptun_core::gather::{repack_frames, DecodedBatch, FrameSink};
use mptun_core::link::{
    bind_for, dial_with_retry, CancelableContext, LinkContext, LinkState, RetryPolicy,
};
use mptun_core::session::{SessionTable, Touch, UdpSession};
use mptun_core::stats::{report_loop, FlowStats};
use mptun_core::transport::{
    decode_segments, enable_offload, is_transient, recv_segments, tcp_recv_loop, tcp_send_loop,
    udp_recv_loop, udp_send_loop, Offload,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Dial attempts after the first when the config leaves retries unbounded.
/// A pair whose forward side never comes up must not linger.
const DEFAULT_FORWARD_RETRIES: u32 = 3;

/// One side of a pair, after `Both` has been ruled out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
    Tcp,
    Udp,
}

impl Leg {
    fn from_kind(kind: TransportKind, field: &str) -> Result<Self> {
        match kind {
            TransportKind::Tcp => Ok(Leg::Tcp),
            TransportKind::Udp => Ok(Leg::Udp),
            TransportKind::Both => anyhow::bail!("relay {field} must be tcp or udp"),
        }
    }
}

/// Bounded hand-off from one side of a pair to the other. Frames are
/// repacked one per sub-packet so a UDP sender emits one frame per datagram.
struct QueueSink {
    tx: mpsc::Sender<BufferHandle>,
    pool: BufferPool,
    stats: Arc<FlowStats>,
}

impl FrameSink for QueueSink {
    fn forward(&self, batch: DecodedBatch) {
        if batch.is_empty() {
            return;
        }
        self.stats
            .input
            .count(batch.frames.len(), batch.payload_bytes());

        let out = repack_frames(&batch, &self.pool);
        drop(batch);
        let (frames, bytes) = (out.sub_packets().len(), out.total_size());
        match self.tx.try_send(out) {
            Ok(()) => self.stats.output.count(frames, bytes),
            Err(e) => tracing::debug!(frames, "relay queue unavailable, dropping batch: {e}"),
        }
    }
}

struct Relay {
    remote: SocketAddr,
    forward: Leg,
    retry: RetryPolicy,
    engine: EngineConfig,
    pool: BufferPool,
    up: Arc<FlowStats>,
    down: Arc<FlowStats>,
}

impl Relay {
    fn queue(&self, stats: &Arc<FlowStats>) -> (Arc<QueueSink>, mpsc::Receiver<BufferHandle>) {
        let (tx, rx) = mpsc::channel(self.engine.channel_size.max(1));
        let sink = QueueSink {
            tx,
            pool: self.pool.clone(),
            stats: Arc::clone(stats),
        };
        (Arc::new(sink), rx)
    }
}

pub async fn run_relay(
    cfg: RelayConfig,
    mut stop: watch::Receiver<bool>,
    log: LogFn,
) -> Result<()> {
    let log = Arc::new(log);
    cfg.validate().context("invalid relay config")?;
    let inbound = Leg::from_kind(cfg.listen_transport, "listen_transport")?;
    let forward = Leg::from_kind(cfg.forward_transport, "forward_transport")?;

    let listen = resolve_addr(&cfg.listen_addr).await?;
    let remote = resolve_addr(&cfg.remote_addr).await?;
    let mut retry = cfg.engine.retry_policy();
    retry.max_retries.get_or_insert(DEFAULT_FORWARD_RETRIES);

    (log.as_ref())(format!(
        "Relay config: {inbound:?} {listen} -> {forward:?} {remote}, retries={:?}",
        retry.max_retries
    ));

    let shutdown = CancellationToken::new();
    let relay = Arc::new(Relay {
        remote,
        forward,
        retry,
        pool: BufferPool::new(cfg.engine.pool_capacity),
        up: FlowStats::new(),
        down: FlowStats::new(),
        engine: cfg.engine,
    });

    let listener = match inbound {
        Leg::Tcp => {
            let tcp = TcpListener::bind(listen)
                .await
                .with_context(|| format!("failed to bind TCP listener on {listen}"))?;
            (log.as_ref())(format!("Relay listening on tcp {}", tcp.local_addr()?));
            tokio::spawn(accept_loop(tcp, Arc::clone(&relay), shutdown.clone()))
        }
        Leg::Udp => {
            let udp = UdpSocket::bind(listen)
                .await
                .with_context(|| format!("failed to bind UDP listener on {listen}"))?;
            let offload = enable_offload(&udp, relay.engine.enable_gro, relay.engine.enable_gso);
            (log.as_ref())(format!(
                "Relay listening on udp {} (gro={} gso={})",
                udp.local_addr()?,
                offload.gro,
                offload.gso
            ));
            tokio::spawn(udp_listen_loop(
                Arc::new(udp),
                offload,
                Arc::clone(&relay),
                shutdown.clone(),
            ))
        }
    };
    let reporter = tokio::spawn(report_loop(
        relay.engine.report_interval,
        vec![("up", Arc::clone(&relay.up)), ("down", Arc::clone(&relay.down))],
        shutdown.clone(),
        {
            let log = Arc::clone(&log);
            move |m| (log.as_ref())(m)
        },
    ));

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    (log.as_ref())("Stop requested".to_string());
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                (log.as_ref())("Ctrl+C received".to_string());
                break;
            }
            _ = shutdown.cancelled() => {
                (log.as_ref())("Relay listener failed, shutting down".to_string());
                break;
            }
        }
    }

    shutdown.cancel();
    let _ = listener.await;
    let _ = reporter.await;
    (log.as_ref())("Relay stopped".to_string());
    Ok(())
}

async fn accept_loop(listener: TcpListener, relay: Arc<Relay>, shutdown: CancellationToken) {
    let mut pairs: Vec<JoinHandle<()>> = Vec::new();
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.cancelled() => break,
        };
        match accepted {
            Ok((stream, peer)) => {
                pairs.retain(|task| !task.is_finished());
                pairs.push(tokio::spawn(serve_tcp(
                    stream,
                    peer,
                    Arc::clone(&relay),
                    shutdown.child_token(),
                )));
            }
            Err(e) => tracing::warn!("relay accept failed: {e}"),
        }
    }
    for task in pairs {
        let _ = task.await;
    }
}

async fn serve_tcp(stream: TcpStream, peer: SocketAddr, relay: Arc<Relay>, token: CancellationToken) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%peer, "set_nodelay failed: {e}");
    }
    tracing::info!(%peer, "relay pair opened (tcp)");

    let ctx = LinkContext::new(peer, token);
    let (up, up_rx) = relay.queue(&relay.up);
    let (down, down_rx) = relay.queue(&relay.down);
    let (reader, writer) = stream.into_split();

    let tasks = [
        tokio::spawn(tcp_recv_loop(Arc::clone(&ctx), reader, relay.pool.clone(), up)),
        tokio::spawn(tcp_send_loop(Arc::clone(&ctx), writer, down_rx)),
        tokio::spawn(forward_side(Arc::clone(&ctx), Arc::clone(&relay), up_rx, down)),
    ];
    ctx.token().cancelled().await;
    for task in tasks {
        let _ = task.await;
    }
    tracing::info!(%peer, "relay pair closed (tcp)");
}

async fn udp_listen_loop(
    sock: Arc<UdpSocket>,
    offload: Offload,
    relay: Arc<Relay>,
    shutdown: CancellationToken,
) {
    let sessions = Arc::new(SessionTable::new(relay.engine.udp_timeout, shutdown.clone()));
    let mut pairs: HashMap<u16, Arc<QueueSink>> = HashMap::new();

    loop {
        let mut handle = relay.pool.allocate();
        let Some(buf) = handle.get_mut() else {
            break;
        };
        let received = tokio::select! {
            received = recv_segments(&sock, buf) => received,
            _ = shutdown.cancelled() => break,
        };
        let from = match received {
            Ok(from) => from,
            Err(e) if is_transient(&e) => {
                tracing::debug!("relay receive: {e}");
                continue;
            }
            Err(e) => {
                tracing::error!("relay udp listener failed: {e}");
                shutdown.cancel();
                break;
            }
        };

        let touch = sessions.touch(from);
        if let Touch::Created(session) = &touch {
            pairs.retain(|_, sink| !sink.tx.is_closed());
            let up = start_udp_pair(
                Arc::clone(session),
                Arc::clone(&sock),
                offload,
                Arc::clone(&relay),
                Arc::clone(&sessions),
            );
            pairs.insert(session.id(), up);
        }
        match pairs.get(&touch.session().id()) {
            Some(up) => up.forward(decode_segments(handle)),
            None => tracing::debug!(%from, "no relay pair for session"),
        }
    }
}

/// Spawn both sides of a UDP-fed pair; returns the sink feeding the forward
/// side.
fn start_udp_pair(
    session: Arc<UdpSession>,
    sock: Arc<UdpSocket>,
    offload: Offload,
    relay: Arc<Relay>,
    sessions: Arc<SessionTable>,
) -> Arc<QueueSink> {
    let addr = session.addr();
    tracing::info!(%addr, session = session.id(), "relay pair opened (udp)");

    let (up, up_rx) = relay.queue(&relay.up);
    let (down, down_rx) = relay.queue(&relay.down);
    let send = tokio::spawn(udp_send_loop(
        Arc::clone(&session),
        sock,
        Some(addr),
        offload,
        down_rx,
    ));
    let forward = tokio::spawn(forward_side(Arc::clone(&session), relay, up_rx, down));

    tokio::spawn(async move {
        tokio::select! {
            _ = session.idle_timer() => {
                tracing::info!(%addr, session = session.id(), "relay session idle");
                session.cancel();
            }
            _ = session.token().cancelled() => {}
        }
        sessions.remove(&addr, session.id());
        let _ = send.await;
        let _ = forward.await;
        tracing::info!(%addr, session = session.id(), "relay pair closed (udp)");
    });
    up
}

/// Dial the forward link of a pair and pump frames over it until the pair's
/// token is cancelled. A dial that runs out of retries cancels the pair.
async fn forward_side<C>(
    ctx: Arc<C>,
    relay: Arc<Relay>,
    up_rx: mpsc::Receiver<BufferHandle>,
    down: Arc<QueueSink>,
) where
    C: CancelableContext + 'static,
{
    let remote = relay.remote;
    let (state, _) = watch::channel(LinkState::Disconnected);

    match relay.forward {
        Leg::Tcp => {
            let stream =
                match dial_with_retry(&relay.retry, ctx.token(), &state, || TcpStream::connect(remote))
                    .await
                {
                    Ok(dialed) => dialed.conn,
                    Err(e) => {
                        tracing::warn!(%remote, "relay forward dial: {e}");
                        ctx.cancel();
                        return;
                    }
                };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(%remote, "set_nodelay failed: {e}");
            }
            tracing::debug!(%remote, "relay forward link up (tcp)");

            let (reader, writer) = stream.into_split();
            let recv = tokio::spawn(tcp_recv_loop(
                Arc::clone(&ctx),
                reader,
                relay.pool.clone(),
                down,
            ));
            tcp_send_loop(Arc::clone(&ctx), writer, up_rx).await;
            ctx.cancel();
            let _ = recv.await;
        }
        Leg::Udp => {
            let sock = match dial_with_retry(&relay.retry, ctx.token(), &state, || bind_for(remote))
                .await
            {
                Ok(dialed) => Arc::new(dialed.conn),
                Err(e) => {
                    tracing::warn!(%remote, "relay forward bind: {e}");
                    ctx.cancel();
                    return;
                }
            };
            let offload = enable_offload(&sock, relay.engine.enable_gro, relay.engine.enable_gso);
            tracing::debug!(%remote, "relay forward link up (udp)");

            let recv = tokio::spawn(udp_recv_loop(
                Arc::clone(&ctx),
                Arc::clone(&sock),
                Some(remote),
                relay.pool.clone(),
                down,
            ));
            udp_send_loop(Arc::clone(&ctx), sock, Some(remote), offload, up_rx).await;
            ctx.cancel();
            let _ = recv.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mptun_core::proto::{decode_batch, encode, Packet, HEADER_SIZE};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn frame(conn_id: u16, packet_id: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_SIZE + payload.len()];
        encode(&Packet::new(conn_id, packet_id, payload), &mut out);
        out
    }

    fn batch(pool: &BufferPool, frames: &[Vec<u8>]) -> DecodedBatch {
        let mut handle = pool.allocate();
        let buf = handle.get_mut().unwrap();
        for f in frames {
            assert!(buf.append(f));
        }
        let (refs, _) = decode_batch(handle.data());
        DecodedBatch::new(handle, refs)
    }

    #[tokio::test]
    async fn test_queue_sink_repacks_and_drops_on_full() {
        let pool = BufferPool::new(8);
        let stats = FlowStats::new();
        let (tx, mut rx) = mpsc::channel(1);
        let sink = QueueSink {
            tx,
            pool: pool.clone(),
            stats: Arc::clone(&stats),
        };

        let a = frame(1, 10, b"first");
        let b = frame(1, 11, b"second");
        sink.forward(batch(&pool, &[a.clone(), b.clone()]));
        sink.forward(batch(&pool, &[frame(2, 1, b"dropped")]));

        let out = rx.try_recv().unwrap();
        let segments: Vec<&[u8]> = out.segments().collect();
        assert_eq!(segments, vec![a.as_slice(), b.as_slice()]);
        assert!(rx.try_recv().is_err());

        assert_eq!(stats.input.take().packets, 3);
        assert_eq!(stats.output.take().packets, 2);
        drop(out);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_relay_rejects_both_as_a_leg() {
        assert_eq!(Leg::from_kind(TransportKind::Udp, "x").unwrap(), Leg::Udp);
        assert!(Leg::from_kind(TransportKind::Both, "x").is_err());
    }

    #[tokio::test]
    async fn test_udp_to_tcp_relay_pumps_both_ways() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = {
            let sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            sock.local_addr().unwrap().port()
        };

        let mut cfg = RelayConfig::default();
        cfg.listen_addr = format!("127.0.0.1:{port}");
        cfg.listen_transport = TransportKind::Udp;
        cfg.remote_addr = server.local_addr().unwrap().to_string();
        cfg.forward_transport = TransportKind::Tcp;
        cfg.engine.reconnect_delay = Duration::from_millis(50);

        let (stop_tx, stop_rx) = watch::channel(false);
        let relay = tokio::spawn(run_relay(cfg, stop_rx, Box::new(|_| {})));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let up = frame(5, 1, b"up through the relay");
        client
            .send_to(&up, ("127.0.0.1", port))
            .await
            .unwrap();

        let (mut stream, _) = tokio::time::timeout(Duration::from_secs(5), server.accept())
            .await
            .unwrap()
            .unwrap();
        let mut got = vec![0u8; up.len()];
        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, up);

        let down = frame(5, 9, b"and back down");
        stream.write_all(&down).await.unwrap();
        let mut reply = vec![0u8; 2048];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply[..n], down.as_slice());

        stop_tx.send(true).unwrap();
        relay.await.unwrap().unwrap();
    }
}
