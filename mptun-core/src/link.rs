//! Relay link lifecycle: dial with retry, run the I/O loops, tear down and
//! re-dial.
//!
//! A link is one connection to one relay peer. While it is up it owns a
//! child [`CancellationToken`] shared by its receive and send loops; either
//! loop failing cancels the token, the supervisor unregisters the outbound
//! queue, and the link dials again unless the process is shutting down.

use crate::buffer::{BufferHandle, BufferPool};
use crate::gather::FrameSink;
use crate::scatter::{OutputId, Scatterer};
use crate::transport;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a link as published on [`LinkHandle::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
    ShuttingDown,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Failed => "failed",
            LinkState::ShuttingDown => "shutting down",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Anything whose tasks share one cancellation token.
pub trait CancelableContext: Send + Sync {
    fn token(&self) -> &CancellationToken;

    fn cancel(&self) {
        self.token().cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.token().is_cancelled()
    }
}

/// Context of one live connection: a relay link or an accepted TCP stream.
#[derive(Debug)]
pub struct LinkContext {
    peer: SocketAddr,
    token: CancellationToken,
}

impl LinkContext {
    pub fn new(peer: SocketAddr, token: CancellationToken) -> Arc<Self> {
        Arc::new(Self { peer, token })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl CancelableContext for LinkContext {
    fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// When and how often to dial again after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// Retries after the first attempt; `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_retries: None,
        }
    }
}

/// Link errors
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("gave up after {attempts} failed attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("shutdown requested")]
    Shutdown,
}

/// A successful dial and how many attempts failed before it.
#[derive(Debug)]
pub struct Dialed<T> {
    pub conn: T,
    pub failures: u32,
}

/// Call `dial` until it succeeds, sleeping `policy.delay` between attempts.
///
/// Publishes `Connecting` before every attempt, `Failed` after each failure
/// and `Connected` on success.
pub async fn dial_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    shutdown: &CancellationToken,
    state: &watch::Sender<LinkState>,
    mut dial: F,
) -> Result<Dialed<T>, LinkError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut failures = 0u32;
    loop {
        state.send_replace(LinkState::Connecting);
        let attempt = tokio::select! {
            attempt = dial() => attempt,
            _ = shutdown.cancelled() => return Err(LinkError::Shutdown),
        };

        match attempt {
            Ok(conn) => {
                state.send_replace(LinkState::Connected);
                return Ok(Dialed { conn, failures });
            }
            Err(err) => {
                failures += 1;
                state.send_replace(LinkState::Failed);
                if policy.max_retries.is_some_and(|max| failures > max) {
                    return Err(LinkError::RetriesExhausted {
                        attempts: failures,
                        source: err,
                    });
                }
                tracing::warn!(
                    attempt = failures,
                    "dial failed: {err}; retrying in {:?}",
                    policy.delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(policy.delay) => {}
                    _ = shutdown.cancelled() => return Err(LinkError::Shutdown),
                }
            }
        }
    }
}

/// Per-peer link settings.
#[derive(Debug, Clone)]
pub struct LinkParams {
    pub peer: SocketAddr,
    pub retry: RetryPolicy,
    /// Outbound queue capacity in batches
    pub queue_capacity: usize,
    /// Share of round-robin traffic relative to other links
    pub weight: u32,
    pub enable_gro: bool,
    pub enable_gso: bool,
}

/// Where a link takes outbound batches from and hands inbound batches to.
#[derive(Clone)]
pub struct LinkPlumbing {
    /// `None` for receive-only links
    pub outbound: Option<Arc<Scatterer>>,
    pub inbound: Arc<dyn FrameSink>,
    pub pool: BufferPool,
}

/// Handle to a spawned link manager.
pub struct LinkHandle {
    pub peer: SocketAddr,
    pub kind: &'static str,
    pub state: watch::Receiver<LinkState>,
    pub task: JoinHandle<()>,
}

impl LinkHandle {
    /// Wait until the link reports `target`, or the manager exits.
    pub async fn wait_for(&mut self, target: LinkState) -> bool {
        self.state.wait_for(|s| *s == target).await.is_ok()
    }
}

/// Spawn a manager keeping a TCP link to `params.peer` alive until
/// `shutdown` fires.
pub fn spawn_tcp_link(
    params: LinkParams,
    plumbing: LinkPlumbing,
    shutdown: CancellationToken,
) -> LinkHandle {
    let (state_tx, state) = watch::channel(LinkState::Disconnected);
    let peer = params.peer;
    let task = tokio::spawn(run_tcp_link(params, plumbing, shutdown, state_tx));
    LinkHandle {
        peer,
        kind: "tcp",
        state,
        task,
    }
}

/// Spawn a manager keeping a UDP link to `params.peer` alive until
/// `shutdown` fires.
pub fn spawn_udp_link(
    params: LinkParams,
    plumbing: LinkPlumbing,
    shutdown: CancellationToken,
) -> LinkHandle {
    let (state_tx, state) = watch::channel(LinkState::Disconnected);
    let peer = params.peer;
    let task = tokio::spawn(run_udp_link(params, plumbing, shutdown, state_tx));
    LinkHandle {
        peer,
        kind: "udp",
        state,
        task,
    }
}

pub async fn run_tcp_link(
    params: LinkParams,
    plumbing: LinkPlumbing,
    shutdown: CancellationToken,
    state: watch::Sender<LinkState>,
) {
    let peer = params.peer;
    loop {
        let dialed = match dial_with_retry(&params.retry, &shutdown, &state, || {
            TcpStream::connect(peer)
        })
        .await
        {
            Ok(dialed) => dialed,
            Err(LinkError::Shutdown) => break,
            Err(err) => {
                tracing::error!(%peer, "tcp link abandoned: {err}");
                break;
            }
        };

        let stream = dialed.conn;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, "failed to set TCP_NODELAY: {e}");
        }
        tracing::info!(%peer, failures = dialed.failures, "tcp link connected");

        let ctx = LinkContext::new(peer, shutdown.child_token());
        let (reader, writer) = stream.into_split();
        let output = register(&plumbing, &params);

        let mut tasks = vec![tokio::spawn(transport::tcp_recv_loop(
            Arc::clone(&ctx),
            reader,
            plumbing.pool.clone(),
            Arc::clone(&plumbing.inbound),
        ))];
        let (output_id, writer) = match output {
            Some((id, queue)) => {
                tasks.push(tokio::spawn(transport::tcp_send_loop(
                    Arc::clone(&ctx),
                    writer,
                    queue,
                )));
                (Some(id), None)
            }
            None => (None, Some(writer)),
        };

        supervise(&ctx, &plumbing, output_id, tasks).await;
        drop(writer);

        if shutdown.is_cancelled() {
            break;
        }
        state.send_replace(LinkState::Failed);
        tracing::warn!(%peer, "tcp link lost, reconnecting");
    }
    finish(&state);
}

pub async fn run_udp_link(
    params: LinkParams,
    plumbing: LinkPlumbing,
    shutdown: CancellationToken,
    state: watch::Sender<LinkState>,
) {
    let peer = params.peer;
    loop {
        let dialed = match dial_with_retry(&params.retry, &shutdown, &state, || {
            bind_for(peer)
        })
        .await
        {
            Ok(dialed) => dialed,
            Err(LinkError::Shutdown) => break,
            Err(err) => {
                tracing::error!(%peer, "udp link abandoned: {err}");
                break;
            }
        };

        let sock = dialed.conn;
        let offload = transport::enable_offload(&sock, params.enable_gro, params.enable_gso);
        let sock = Arc::new(sock);
        tracing::info!(%peer, gro = offload.gro, gso = offload.gso, "udp link ready");

        let ctx = LinkContext::new(peer, shutdown.child_token());
        let output = register(&plumbing, &params);

        let mut tasks = vec![tokio::spawn(transport::udp_recv_loop(
            Arc::clone(&ctx),
            Arc::clone(&sock),
            Some(peer),
            plumbing.pool.clone(),
            Arc::clone(&plumbing.inbound),
        ))];
        let output_id = output.map(|(id, queue)| {
            tasks.push(tokio::spawn(transport::udp_send_loop(
                Arc::clone(&ctx),
                Arc::clone(&sock),
                Some(peer),
                offload,
                queue,
            )));
            id
        });

        supervise(&ctx, &plumbing, output_id, tasks).await;

        if shutdown.is_cancelled() {
            break;
        }
        state.send_replace(LinkState::Failed);
        tracing::warn!(%peer, "udp link lost, rebinding");
        // Rebinds are paced like failed dials.
        tokio::select! {
            _ = tokio::time::sleep(params.retry.delay) => {}
            _ = shutdown.cancelled() => break,
        }
    }
    finish(&state);
}

/// Bind an unconnected socket of the same family as `peer`.
pub async fn bind_for(peer: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = if peer.is_ipv4() {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    UdpSocket::bind(local).await
}

fn register(
    plumbing: &LinkPlumbing,
    params: &LinkParams,
) -> Option<(OutputId, mpsc::Receiver<BufferHandle>)> {
    plumbing
        .outbound
        .as_ref()
        .map(|scatterer| scatterer.new_output(params.queue_capacity, params.weight))
}

/// Wait for the link's token, then unregister its queue and join its loops.
pub async fn supervise(
    ctx: &LinkContext,
    plumbing: &LinkPlumbing,
    output: Option<OutputId>,
    tasks: Vec<JoinHandle<()>>,
) {
    ctx.token().cancelled().await;
    tracing::debug!(peer = %ctx.peer(), "link cancelled, tearing down");

    if let (Some(id), Some(scatterer)) = (output, plumbing.outbound.as_ref()) {
        if let Err(e) = scatterer.remove_output(id) {
            tracing::debug!("{e}");
        }
    }
    for task in tasks {
        let _ = task.await;
    }
}

fn finish(state: &watch::Sender<LinkState>) {
    state.send_replace(LinkState::ShuttingDown);
    state.send_replace(LinkState::Closed);
}

/// Links of one relay peer, keyed for shutdown reporting.
pub struct LinkSet {
    links: Vec<LinkHandle>,
}

impl LinkSet {
    pub fn new() -> Self {
        Self { links: Vec::new() }
    }

    pub fn push(&mut self, link: LinkHandle) {
        self.links.push(link);
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Current state of every link.
    pub fn states(&self) -> Vec<(SocketAddr, &'static str, LinkState)> {
        self.links
            .iter()
            .map(|l| (l.peer, l.kind, *l.state.borrow()))
            .collect()
    }

    /// Wait for every manager to exit.
    pub async fn join(self) {
        for link in self.links {
            let _ = link.task.await;
        }
    }
}

impl Default for LinkSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gather::{DecodedBatch, Gatherer};
    use crate::proto::{push_frame, Packet};
    use crate::scatter::ScatterMode;
    use crate::stats::FlowStats;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_dial_retries_with_delay() {
        let policy = RetryPolicy {
            delay: Duration::from_secs(2),
            max_retries: None,
        };
        let shutdown = CancellationToken::new();
        let (state, _rx) = watch::channel(LinkState::Disconnected);
        let attempts = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&attempts);
        let dialed = dial_with_retry(&policy, &shutdown, &state, || {
            let seen = Arc::clone(&seen);
            async move {
                let mut seen = seen.lock().unwrap();
                seen.push(Instant::now());
                if seen.len() <= 3 {
                    Err(io::Error::from(io::ErrorKind::ConnectionRefused))
                } else {
                    Ok("conn")
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(dialed.conn, "conn");
        assert_eq!(dialed.failures, 3);
        assert_eq!(*state.borrow(), LinkState::Connected);

        let attempts = attempts.lock().unwrap();
        assert_eq!(attempts.len(), 4);
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= policy.delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_gives_up_after_max_retries() {
        let policy = RetryPolicy {
            delay: Duration::from_millis(100),
            max_retries: Some(2),
        };
        let (state, _rx) = watch::channel(LinkState::Disconnected);
        let mut calls = 0;

        let result: Result<Dialed<()>, _> =
            dial_with_retry(&policy, &CancellationToken::new(), &state, || {
                calls += 1;
                async { Err(io::Error::from(io::ErrorKind::TimedOut)) }
            })
            .await;

        assert!(matches!(
            result,
            Err(LinkError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(calls, 3);
        assert_eq!(*state.borrow(), LinkState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let (state, _rx) = watch::channel(LinkState::Disconnected);
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stopper.cancel();
        });

        let result: Result<Dialed<()>, _> =
            dial_with_retry(&RetryPolicy::default(), &shutdown, &state, || async {
                Err(io::Error::from(io::ErrorKind::ConnectionRefused))
            })
            .await;
        assert!(matches!(result, Err(LinkError::Shutdown)));
    }

    #[tokio::test]
    async fn test_tcp_link_carries_frames_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = listener.local_addr().unwrap();
        let pool = BufferPool::new(8);
        let scatterer = Arc::new(Scatterer::new(ScatterMode::RoundRobin, FlowStats::new()));
        let (gatherer, mut gathered) = Gatherer::new(8, FlowStats::new());
        let shutdown = CancellationToken::new();

        let mut link = spawn_tcp_link(
            LinkParams {
                peer,
                retry: RetryPolicy::default(),
                queue_capacity: 8,
                weight: 1,
                enable_gro: false,
                enable_gso: false,
            },
            LinkPlumbing {
                outbound: Some(Arc::clone(&scatterer)),
                inbound: Arc::new(gatherer),
                pool: pool.clone(),
            },
            shutdown.clone(),
        );

        let (mut remote, _) = listener.accept().await.unwrap();
        assert!(link.wait_for(LinkState::Connected).await);
        while scatterer.output_count() == 0 {
            tokio::task::yield_now().await;
        }

        let mut out = pool.allocate();
        assert!(push_frame(out.get_mut().unwrap(), &Packet::new(1, 10, b"up")));
        let expected = out.data().to_vec();
        scatterer.scatter(out);
        let mut wire = vec![0u8; expected.len()];
        remote.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire, expected);

        let mut frame = vec![0u8; 64];
        let n = crate::proto::encode(&Packet::new(1, 11, b"down"), &mut frame);
        remote.write_all(&frame[..n]).await.unwrap();
        let batch: DecodedBatch = gathered.recv().await.unwrap();
        assert_eq!(batch.payload(&batch.frames[0]), b"down");

        shutdown.cancel();
        link.task.await.unwrap();
        assert_eq!(*link.state.borrow(), LinkState::Closed);
        assert_eq!(scatterer.output_count(), 0);
    }

    #[tokio::test]
    async fn test_tcp_link_redials_after_peer_drops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = listener.local_addr().unwrap();
        let pool = BufferPool::new(8);
        let scatterer = Arc::new(Scatterer::new(ScatterMode::RoundRobin, FlowStats::new()));
        let (gatherer, _gathered) = Gatherer::new(8, FlowStats::new());
        let shutdown = CancellationToken::new();
        let wait = Duration::from_secs(5);

        let mut link = spawn_tcp_link(
            LinkParams {
                peer,
                retry: RetryPolicy {
                    delay: Duration::from_millis(300),
                    max_retries: None,
                },
                queue_capacity: 8,
                weight: 1,
                enable_gro: false,
                enable_gso: false,
            },
            LinkPlumbing {
                outbound: Some(Arc::clone(&scatterer)),
                inbound: Arc::new(gatherer),
                pool: pool.clone(),
            },
            shutdown.clone(),
        );

        let (first, _) = listener.accept().await.unwrap();
        assert!(link.wait_for(LinkState::Connected).await);
        while scatterer.output_count() == 0 {
            tokio::task::yield_now().await;
        }

        // Close the peer side and refuse the first redial so the link sits
        // in Failed for a retry delay.
        drop(first);
        drop(listener);
        assert!(tokio::time::timeout(wait, link.wait_for(LinkState::Failed))
            .await
            .unwrap());
        assert_eq!(scatterer.output_count(), 0);

        let listener = TcpListener::bind(peer).await.unwrap();
        let (mut second, _) = tokio::time::timeout(wait, listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert!(tokio::time::timeout(wait, link.wait_for(LinkState::Connected))
            .await
            .unwrap());
        tokio::time::timeout(wait, async {
            while scatterer.output_count() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(scatterer.output_count(), 1);

        let mut out = pool.allocate();
        assert!(push_frame(out.get_mut().unwrap(), &Packet::new(2, 20, b"again")));
        let expected = out.data().to_vec();
        scatterer.scatter(out);
        let mut wire = vec![0u8; expected.len()];
        tokio::time::timeout(wait, second.read_exact(&mut wire))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wire, expected);

        shutdown.cancel();
        link.task.await.unwrap();
        assert_eq!(*link.state.borrow(), LinkState::Closed);
    }
}
