//! Server-side UDP sessions keyed by client address, evicted when idle.

use crate::link::CancelableContext;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One client address talking to the server over UDP.
#[derive(Debug)]
pub struct UdpSession {
    id: u16,
    addr: SocketAddr,
    token: CancellationToken,
    timeout: Duration,
    last_seen: Mutex<Instant>,
}

impl UdpSession {
    fn new(id: u16, addr: SocketAddr, token: CancellationToken, timeout: Duration) -> Self {
        Self {
            id,
            addr,
            token,
            timeout,
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Push the idle deadline out by a full timeout.
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn deadline(&self) -> Instant {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) + self.timeout
    }

    /// True once the deadline passed or the session was cancelled.
    pub fn is_stale(&self, now: Instant) -> bool {
        self.is_cancelled() || now >= self.deadline()
    }

    /// Resolves once the session has gone `timeout` without a `touch`.
    pub async fn idle_timer(&self) {
        loop {
            let deadline = self.deadline();
            tokio::time::sleep_until(deadline).await;
            if Instant::now() >= self.deadline() {
                return;
            }
        }
    }
}

impl CancelableContext for UdpSession {
    fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Outcome of [`SessionTable::touch`].
#[derive(Debug)]
pub enum Touch {
    Existing(Arc<UdpSession>),
    /// A new session; the caller starts its tasks.
    Created(Arc<UdpSession>),
}

impl Touch {
    pub fn session(&self) -> &Arc<UdpSession> {
        match self {
            Touch::Existing(s) | Touch::Created(s) => s,
        }
    }
}

/// Address to session map shared by the UDP listener and session tasks.
#[derive(Debug)]
pub struct SessionTable {
    sessions: RwLock<HashMap<SocketAddr, Arc<UdpSession>>>,
    next_id: AtomicU16,
    timeout: Duration,
    parent: CancellationToken,
}

impl SessionTable {
    /// Sessions get child tokens of `parent`, so cancelling it ends them all.
    pub fn new(timeout: Duration, parent: CancellationToken) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU16::new(0),
            timeout,
            parent,
        }
    }

    /// Find the live session for `addr` and refresh it, or replace a stale
    /// one with a fresh session.
    pub fn touch(&self, addr: SocketAddr) -> Touch {
        let now = Instant::now();
        {
            let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(session) = sessions.get(&addr) {
                if !session.is_stale(now) {
                    session.touch();
                    return Touch::Existing(Arc::clone(session));
                }
            }
        }

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = sessions.get(&addr) {
            if !session.is_stale(now) {
                session.touch();
                return Touch::Existing(Arc::clone(session));
            }
            tracing::debug!(%addr, session = session.id, "evicting stale session");
            session.cancel();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(UdpSession::new(
            id,
            addr,
            self.parent.child_token(),
            self.timeout,
        ));
        sessions.insert(addr, Arc::clone(&session));
        tracing::debug!(%addr, session = id, "new udp session");
        Touch::Created(session)
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<UdpSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(addr)
            .cloned()
    }

    /// Remove `addr` only if it still maps to session `id`.
    pub fn remove(&self, addr: &SocketAddr, id: u16) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(addr) {
            Some(session) if session.id == id => {
                sessions.remove(addr);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
