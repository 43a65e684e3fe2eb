use anyhow::{Context, Result};
use mptun_core::buffer::BufferPool;
use mptun_core::control::{resolve_addr, EngineConfig, ServerConfig};
use mptun_core::gather::{split_by_conn, DecodedBatch, FrameSink, Gatherer};
use mptun_core::link::{bind_for, supervise, CancelableContext, LinkContext, LinkPlumbing};
use mptun_core::proto::{pack_datagrams, PacketIds};
use mptun_core::scatter::Scatterer;
use mptun_core::session::{SessionTable, Touch, UdpSession};
use mptun_core::stats::{report_loop, FlowStats};
use mptun_core::transport::{
    decode_segments, enable_offload, is_transient, recv_segments, send_segments, tcp_recv_loop,
    tcp_send_loop, udp_send_loop, Offload,
};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub type LogFn = Box<dyn Fn(String) + Send + Sync + 'static>;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// State shared by the listener tasks.
struct Server {
    engine: EngineConfig,
    plumbing: LinkPlumbing,
    scatterer: Arc<Scatterer>,
    sessions: SessionTable,
    udp: Arc<UdpSocket>,
    offload: Offload,
}

pub async fn run_server(
    cfg: ServerConfig,
    mut stop: watch::Receiver<bool>,
    log: LogFn,
) -> Result<()> {
    let log = Arc::new(log);
    cfg.validate().context("invalid server config")?;
    let engine = cfg.engine.clone();

    (log.as_ref())(format!(
        "Server config: listen={} remote={} mode={:?} udp_timeout={:?}",
        cfg.listen_addr, cfg.remote_addr, engine.scatter_mode, engine.udp_timeout
    ));

    let listen = resolve_addr(&cfg.listen_addr).await?;
    let remote = resolve_addr(&cfg.remote_addr).await?;

    let tcp = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind TCP listener on {listen}"))?;
    // Share the TCP port when it was picked by the OS.
    let listen = tcp.local_addr()?;
    let udp = UdpSocket::bind(listen)
        .await
        .with_context(|| format!("failed to bind UDP listener on {listen}"))?;
    let offload = enable_offload(&udp, engine.enable_gro, engine.enable_gso);
    (log.as_ref())(format!(
        "Listening on {listen} (tcp+udp, gro={} gso={}), forwarding to {remote}",
        offload.gro, offload.gso
    ));

    let shutdown = CancellationToken::new();
    let pool = BufferPool::new(engine.pool_capacity);
    let scatter_stats = FlowStats::new();
    let gather_stats = FlowStats::new();
    let scatterer = Arc::new(Scatterer::new(engine.scatter_mode, Arc::clone(&scatter_stats)));
    let (gatherer, gathered) = Gatherer::new(engine.channel_size, Arc::clone(&gather_stats));
    let gatherer: Arc<dyn FrameSink> = Arc::new(gatherer);

    let server = Arc::new(Server {
        plumbing: LinkPlumbing {
            outbound: Some(Arc::clone(&scatterer)),
            inbound: gatherer,
            pool: pool.clone(),
        },
        scatterer: Arc::clone(&scatterer),
        sessions: SessionTable::new(engine.udp_timeout, shutdown.clone()),
        udp: Arc::new(udp),
        offload,
        engine,
    });

    let acceptor = tokio::spawn(accept_loop(tcp, Arc::clone(&server), shutdown.clone()));
    let listener = tokio::spawn(udp_listen_loop(Arc::clone(&server), shutdown.clone()));
    let forward = tokio::spawn(forward_loop(
        gathered,
        remote,
        Arc::clone(&server),
        shutdown.clone(),
    ));
    let reporter = tokio::spawn(report_loop(
        server.engine.report_interval,
        vec![("scatter", scatter_stats), ("gather", gather_stats)],
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
                (log.as_ref())("UDP listener failed, shutting down".to_string());
                break;
            }
        }
    }

    shutdown.cancel();
    let _ = acceptor.await;
    let _ = listener.await;
    let _ = forward.await;
    let _ = reporter.await;
    (log.as_ref())(format!(
        "Server stopped ({} udp sessions, {} outbound queues left)",
        server.sessions.len(),
        scatterer.output_count()
    ));
    Ok(())
}

/// Accept TCP links until shutdown. Accepted links are never redialled from
/// this side.
async fn accept_loop(listener: TcpListener, server: Arc<Server>, shutdown: CancellationToken) {
    let mut links: Vec<JoinHandle<()>> = Vec::new();
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.cancelled() => break,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("tcp accept failed: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        links.retain(|task| !task.is_finished());
        links.push(tokio::spawn(serve_tcp(
            stream,
            peer,
            Arc::clone(&server),
            shutdown.child_token(),
        )));
    }
    for task in links {
        let _ = task.await;
    }
}

async fn serve_tcp(stream: TcpStream, peer: SocketAddr, server: Arc<Server>, token: CancellationToken) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%peer, "set_nodelay failed: {e}");
    }
    tracing::info!(%peer, "tcp link accepted");

    let ctx = LinkContext::new(peer, token);
    let (reader, writer) = stream.into_split();
    let (output, queue) = server
        .scatterer
        .new_output(server.engine.channel_size, 1);
    let tasks = vec![
        tokio::spawn(tcp_recv_loop(
            Arc::clone(&ctx),
            reader,
            server.plumbing.pool.clone(),
            Arc::clone(&server.plumbing.inbound),
        )),
        tokio::spawn(tcp_send_loop(Arc::clone(&ctx), writer, queue)),
    ];
    supervise(&ctx, &server.plumbing, Some(output), tasks).await;
    tracing::info!(%peer, "tcp link closed");
}

/// Receive on the shared UDP socket, routing every datagram through the
/// session table before handing its frames to the gatherer.
async fn udp_listen_loop(server: Arc<Server>, shutdown: CancellationToken) {
    loop {
        let mut handle = server.plumbing.pool.allocate();
        let Some(buf) = handle.get_mut() else {
            break;
        };
        let received = tokio::select! {
            received = recv_segments(&server.udp, buf) => received,
            _ = shutdown.cancelled() => break,
        };
        let from = match received {
            Ok(from) => from,
            Err(e) if is_transient(&e) => {
                tracing::debug!("udp listener receive: {e}");
                continue;
            }
            Err(e) => {
                tracing::error!("udp listener failed: {e}");
                shutdown.cancel();
                break;
            }
        };

        if let Touch::Created(session) = server.sessions.touch(from) {
            start_session(&server, session);
        }
        server.plumbing.inbound.forward(decode_segments(handle));
    }
}

/// Register the session's outbound queue and run its send loop until the
/// session idles out or is cancelled.
fn start_session(server: &Arc<Server>, session: Arc<UdpSession>) {
    let addr = session.addr();
    tracing::info!(%addr, session = session.id(), "udp session opened");

    let (output, queue) = server
        .scatterer
        .new_output(server.engine.channel_size, 1);
    let send = tokio::spawn(udp_send_loop(
        Arc::clone(&session),
        Arc::clone(&server.udp),
        Some(addr),
        server.offload,
        queue,
    ));

    let server = Arc::clone(server);
    tokio::spawn(async move {
        tokio::select! {
            _ = session.idle_timer() => {
                tracing::info!(%addr, session = session.id(), "udp session idle");
                session.cancel();
            }
            _ = session.token().cancelled() => {}
        }
        if let Err(e) = server.scatterer.remove_output(output) {
            tracing::debug!("{e}");
        }
        server.sessions.remove(&addr, session.id());
        let _ = send.await;
        tracing::info!(%addr, session = session.id(), "udp session closed");
    });
}

/// Socket toward the remote service for one connection id.
struct Upstream {
    sock: Arc<UdpSocket>,
    gso: bool,
}

async fn open_upstream(remote: SocketAddr, engine: &EngineConfig) -> io::Result<(UdpSocket, Offload)> {
    let sock = bind_for(remote).await?;
    sock.connect(remote).await?;
    let offload = enable_offload(&sock, engine.enable_gro, engine.enable_gso);
    Ok((sock, offload))
}

/// Gathered frames out to the remote service, one socket per connection id.
async fn forward_loop(
    mut gathered: mpsc::Receiver<DecodedBatch>,
    remote: SocketAddr,
    server: Arc<Server>,
    shutdown: CancellationToken,
) {
    let ids = Arc::new(PacketIds::new());
    let mut upstreams: HashMap<u16, Upstream> = HashMap::new();
    let mut reverse: Vec<JoinHandle<()>> = Vec::new();

    loop {
        let batch = tokio::select! {
            batch = gathered.recv() => batch,
            _ = shutdown.cancelled() => break,
        };
        let Some(batch) = batch else {
            break;
        };

        let groups = split_by_conn(&batch, &server.plumbing.pool);
        drop(batch);
        for (conn_id, datagrams) in groups {
            let upstream = match upstreams.entry(conn_id) {
                Entry::Occupied(slot) => slot.into_mut(),
                Entry::Vacant(slot) => match open_upstream(remote, &server.engine).await {
                    Ok((sock, offload)) => {
                        let sock = Arc::new(sock);
                        tracing::info!(conn_id, local = ?sock.local_addr().ok(), "upstream socket opened");
                        reverse.push(tokio::spawn(reverse_loop(
                            conn_id,
                            Arc::clone(&sock),
                            Arc::clone(&ids),
                            Arc::clone(&server),
                            shutdown.clone(),
                        )));
                        slot.insert(Upstream {
                            sock,
                            gso: offload.gso,
                        })
                    }
                    Err(e) => {
                        tracing::warn!(conn_id, %remote, "failed to open upstream socket: {e}");
                        continue;
                    }
                },
            };

            match send_segments(&upstream.sock, None, &datagrams, upstream.gso).await {
                Ok(()) => {}
                Err(e) if is_transient(&e) => tracing::debug!(conn_id, "upstream send: {e}"),
                Err(e) => tracing::warn!(conn_id, %remote, "upstream send failed: {e}"),
            }
        }
    }

    for task in reverse {
        let _ = task.await;
    }
}

/// Replies from the remote service, framed under `conn_id` with fresh
/// packet ids and scattered back toward the client.
async fn reverse_loop(
    conn_id: u16,
    sock: Arc<UdpSocket>,
    ids: Arc<PacketIds>,
    server: Arc<Server>,
    shutdown: CancellationToken,
) {
    let pool = &server.plumbing.pool;
    loop {
        let mut inbound = pool.allocate();
        let Some(buf) = inbound.get_mut() else {
            break;
        };
        let received = tokio::select! {
            received = recv_segments(&sock, buf) => received,
            _ = shutdown.cancelled() => break,
        };
        match received {
            Ok(_) => {
                pack_datagrams(
                    conn_id,
                    &ids,
                    &inbound,
                    server.engine.max_udp_size,
                    pool,
                    |batch| server.scatterer.scatter(batch),
                );
            }
            Err(e) if is_transient(&e) => tracing::debug!(conn_id, "upstream receive: {e}"),
            Err(e) => {
                tracing::warn!(conn_id, "upstream receive failed: {e}");
                break;
            }
        }
    }
}
