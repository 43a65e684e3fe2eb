use anyhow::{Context, Result};
use mptun_core::buffer::BufferPool;
use mptun_core::control::{resolve_addr, ClientConfig};
use mptun_core::gather::{split_by_conn, DecodedBatch, Discard, FrameSink, Gatherer};
use mptun_core::link::{spawn_tcp_link, spawn_udp_link, LinkParams, LinkPlumbing, LinkSet};
use mptun_core::proto::{pack_datagrams, PacketIds};
use mptun_core::scatter::Scatterer;
use mptun_core::stats::{report_loop, FlowStats};
use mptun_core::transport::{enable_offload, is_transient, recv_segments, send_segments};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

pub type LogFn = Box<dyn Fn(String) + Send + Sync + 'static>;

/// Application source addresses and the connection ids assigned to them.
#[derive(Debug, Default)]
pub struct ConnectionMap {
    inner: RwLock<Connections>,
}

#[derive(Debug, Default)]
struct Connections {
    by_addr: HashMap<SocketAddr, u16>,
    by_id: HashMap<u16, SocketAddr>,
    next: u16,
}

impl ConnectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection id for `addr`, assigning the next one on first sight.
    ///
    /// Ids wrap at 0xFFFF; a reused id forgets its previous address.
    pub fn id_for(&self, addr: SocketAddr) -> u16 {
        if let Some(&id) = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_addr
            .get(&addr)
        {
            return id;
        }

        let mut conns = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(&id) = conns.by_addr.get(&addr) {
            return id;
        }
        let id = conns.next;
        conns.next = conns.next.wrapping_add(1);
        if let Some(stale) = conns.by_id.insert(id, addr) {
            conns.by_addr.remove(&stale);
        }
        conns.by_addr.insert(addr, id);
        tracing::info!(%addr, conn_id = id, "new application connection");
        id
    }

    pub fn addr_of(&self, id: u16) -> Option<SocketAddr> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(&id)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_addr
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub async fn run_client(
    cfg: ClientConfig,
    mut stop: watch::Receiver<bool>,
    log: LogFn,
) -> Result<()> {
    let log = Arc::new(log);
    cfg.validate().context("invalid client config")?;
    let engine = &cfg.engine;

    (log.as_ref())(format!(
        "Client config: listen={} peers={} mode={:?} channel_size={}",
        cfg.listen_addr,
        cfg.relay_peers.len(),
        engine.scatter_mode,
        engine.channel_size
    ));

    let listen = resolve_addr(&cfg.listen_addr).await?;
    let listener = UdpSocket::bind(listen)
        .await
        .with_context(|| format!("failed to bind UDP listener on {listen}"))?;
    let offload = enable_offload(&listener, engine.enable_gro, engine.enable_gso);
    let listener = Arc::new(listener);
    (log.as_ref())(format!(
        "Listening for applications on {} (gro={} gso={})",
        listener.local_addr()?,
        offload.gro,
        offload.gso
    ));

    let shutdown = CancellationToken::new();
    let pool = BufferPool::new(engine.pool_capacity);
    let scatter_stats = FlowStats::new();
    let gather_stats = FlowStats::new();
    let scatterer = Arc::new(Scatterer::new(engine.scatter_mode, Arc::clone(&scatter_stats)));
    let (gatherer, gathered) = Gatherer::new(engine.channel_size, Arc::clone(&gather_stats));
    let gatherer: Arc<dyn FrameSink> = Arc::new(gatherer);
    let discard: Arc<dyn FrameSink> = Arc::new(Discard);

    let mut links = LinkSet::new();
    for peer in &cfg.relay_peers {
        let addr = resolve_addr(&peer.addr).await?;
        let params = LinkParams {
            peer: addr,
            retry: engine.retry_policy(),
            queue_capacity: engine.channel_size,
            weight: peer.weight,
            enable_gro: engine.enable_gro,
            enable_gso: engine.enable_gso,
        };
        let plumbing = LinkPlumbing {
            outbound: peer.traffic.sends().then(|| Arc::clone(&scatterer)),
            inbound: if peer.traffic.receives() {
                Arc::clone(&gatherer)
            } else {
                Arc::clone(&discard)
            },
            pool: pool.clone(),
        };

        if peer.transport.uses_tcp() {
            links.push(spawn_tcp_link(
                params.clone(),
                plumbing.clone(),
                shutdown.clone(),
            ));
        }
        if peer.transport.uses_udp() {
            links.push(spawn_udp_link(params, plumbing, shutdown.clone()));
        }
        (log.as_ref())(format!(
            "Relay peer {addr}: transport={:?} weight={} traffic={:?}",
            peer.transport, peer.weight, peer.traffic
        ));
    }

    let connections = Arc::new(ConnectionMap::new());
    let forward = tokio::spawn(forward_loop(
        Arc::clone(&listener),
        Arc::clone(&connections),
        Arc::clone(&scatterer),
        pool.clone(),
        engine.max_udp_size,
        shutdown.clone(),
    ));
    let reverse = tokio::spawn(reverse_loop(
        Arc::clone(&listener),
        Arc::clone(&connections),
        gathered,
        pool.clone(),
        offload.gso,
        shutdown.clone(),
    ));
    let reporter = tokio::spawn(report_loop(
        engine.report_interval,
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
                (log.as_ref())("Application listener failed, shutting down".to_string());
                break;
            }
        }
    }

    shutdown.cancel();
    let _ = forward.await;
    let _ = reverse.await;
    let _ = reporter.await;
    for (peer, kind, state) in links.states() {
        (log.as_ref())(format!("Link {kind} {peer}: {state}"));
    }
    links.join().await;
    (log.as_ref())(format!(
        "Client stopped ({} application connections)",
        connections.len()
    ));
    Ok(())
}

/// Application datagrams in, framed batches out to the scatterer.
async fn forward_loop(
    listener: Arc<UdpSocket>,
    connections: Arc<ConnectionMap>,
    scatterer: Arc<Scatterer>,
    pool: BufferPool,
    max_udp_size: usize,
    shutdown: CancellationToken,
) {
    let ids = PacketIds::new();
    loop {
        let mut inbound = pool.allocate();
        let Some(buf) = inbound.get_mut() else {
            break;
        };
        let received = tokio::select! {
            received = recv_segments(&listener, buf) => received,
            _ = shutdown.cancelled() => break,
        };
        let from = match received {
            Ok(from) => from,
            Err(e) if is_transient(&e) => {
                tracing::debug!("application receive: {e}");
                continue;
            }
            Err(e) => {
                tracing::error!("application listener failed: {e}");
                shutdown.cancel();
                break;
            }
        };

        let conn_id = connections.id_for(from);
        pack_datagrams(conn_id, &ids, &inbound, max_udp_size, &pool, |batch| {
            scatterer.scatter(batch)
        });
    }
}

/// Gathered frames back to the application addresses they belong to.
async fn reverse_loop(
    listener: Arc<UdpSocket>,
    connections: Arc<ConnectionMap>,
    mut gathered: mpsc::Receiver<DecodedBatch>,
    pool: BufferPool,
    gso: bool,
    shutdown: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            batch = gathered.recv() => batch,
            _ = shutdown.cancelled() => break,
        };
        let Some(batch) = batch else {
            break;
        };

        let groups = split_by_conn(&batch, &pool);
        drop(batch);
        for (conn_id, datagrams) in groups {
            let Some(addr) = connections.addr_of(conn_id) else {
                tracing::debug!(conn_id, "dropping frames for unknown connection");
                continue;
            };
            if let Err(e) = send_segments(&listener, Some(addr), &datagrams, gso).await {
                tracing::warn!(%addr, conn_id, "failed to deliver to application: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_connection_ids_are_stable_and_sequential() {
        let conns = ConnectionMap::new();
        assert_eq!(conns.id_for(addr(1000)), 0);
        assert_eq!(conns.id_for(addr(1001)), 1);
        assert_eq!(conns.id_for(addr(1000)), 0);
        assert_eq!(conns.addr_of(1), Some(addr(1001)));
        assert_eq!(conns.addr_of(2), None);
        assert_eq!(conns.len(), 2);
    }

    #[test]
    fn test_connection_id_wrap_forgets_old_owner() {
        let conns = ConnectionMap::new();
        for port in 0..=u16::MAX {
            conns.id_for(addr(port));
        }
        let other = SocketAddr::from(([127, 0, 0, 2], 9));
        assert_eq!(conns.id_for(other), 0);
        assert_eq!(conns.addr_of(0), Some(other));
        assert_eq!(conns.len(), 65536);
        // The previous owner of id 0 gets a new id.
        assert_eq!(conns.id_for(addr(0)), 1);
    }
}
