//! Upstream targets: health state, dialing, and the reply-direction legs
//!
//! Each backend owns its own readiness poller and connection table for the
//! backend-to-client direction of every tunnel routed to it, plus a health
//! loop that probes the target with a plain TCP connect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config;
use crate::conn::ConnTable;
use crate::error::ProxyError;
use crate::pool::BufferPool;

/// Connect timeout for both health probes and client-driven dials
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between active health probes
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// One upstream target address
#[derive(Debug)]
pub struct Backend {
    addr: String,
    active: AtomicBool,
    conns: Arc<ConnTable>,
    dial_timeout: Duration,
    health_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Backend {
    /// Validate the target address syntactically and set up the table.
    /// Backends start inactive until the first health probe succeeds.
    pub fn new(
        addr: &str,
        buf_pool: Arc<BufferPool>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Arc<Backend>, ProxyError> {
        config::split_host_port(addr)?;
        let conns = ConnTable::new(format!("backend {}", addr), buf_pool, shutdown.clone())
            .map_err(ProxyError::Poller)?;
        Ok(Arc::new(Backend {
            addr: addr.to_string(),
            active: AtomicBool::new(false),
            conns,
            dial_timeout: DIAL_TIMEOUT,
            health_interval: HEALTH_CHECK_INTERVAL,
            shutdown,
        }))
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Number of reply-direction legs currently tracked for this target
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn conns(&self) -> &Arc<ConnTable> {
        &self.conns
    }

    /// Record the outcome of the most recent connect attempt. Logged only
    /// when the value actually changes.
    pub(crate) fn set_active(&self, active: bool) {
        if self
            .active
            .compare_exchange(!active, active, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!(backend = %self.addr, active, "backend health changed");
        }
    }

    /// Dial the target for a new tunnel, returning a blocking-mode socket.
    /// A failed dial marks the backend inactive (passive health check);
    /// no other backend is tried here.
    pub async fn create_conn(&self) -> Result<std::net::TcpStream, ProxyError> {
        let stream = match timeout(self.dial_timeout, TcpStream::connect(self.addr.as_str())).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.set_active(false);
                return Err(ProxyError::Dial {
                    addr: self.addr.clone(),
                    source: e,
                });
            }
            Err(_) => {
                self.set_active(false);
                return Err(ProxyError::DialTimeout {
                    addr: self.addr.clone(),
                });
            }
        };
        if let Ok(local) = stream.local_addr() {
            debug!(backend = %self.addr, connection = %local, "new remote connection");
        }
        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;
        Ok(stream)
    }

    /// One active health probe: can the target be connected to at all?
    /// The probe socket is closed immediately.
    async fn probe(&self) -> bool {
        matches!(
            timeout(self.dial_timeout, TcpStream::connect(self.addr.as_str())).await,
            Ok(Ok(_))
        )
    }

    /// Active health checking: one probe right after start, then one every
    /// interval until shutdown.
    async fn health_loop(&self) {
        let mut shutdown_rx = self.shutdown.clone();

        let alive = self.probe().await;
        self.set_active(alive);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.health_interval) => {
                    let alive = self.probe().await;
                    self.set_active(alive);
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Drive the backend until shutdown: health loop plus readiness loop,
    /// then close the poller and every tracked socket.
    pub async fn run(self: Arc<Self>) {
        let health = {
            let backend = Arc::clone(&self);
            tokio::spawn(async move { backend.health_loop().await })
        };
        let poll = {
            let conns = Arc::clone(&self.conns);
            tokio::task::spawn_blocking(move || conns.poll_loop())
        };

        let mut shutdown_rx = self.shutdown.clone();
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }

        info!(backend = %self.addr, "closing connections");
        self.conns.close_all();
        let _ = health.await;
        let _ = poll.await;
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    fn test_backend(addr: &str) -> (Arc<Backend>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let backend = Backend::new(addr, Arc::new(BufferPool::new()), rx).unwrap();
        (backend, tx)
    }

    #[test]
    fn test_new_rejects_invalid_target() {
        let (_tx, rx) = watch::channel(false);
        let err = Backend::new("not-an-address", Arc::new(BufferPool::new()), rx).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidTarget(_)));
    }

    #[test]
    fn test_starts_inactive_and_transitions_on_set_active() {
        let (backend, _tx) = test_backend("127.0.0.1:9001");
        assert!(!backend.is_active());
        backend.set_active(true);
        assert!(backend.is_active());
        backend.set_active(true);
        assert!(backend.is_active());
        backend.set_active(false);
        assert!(!backend.is_active());
    }

    #[tokio::test]
    async fn test_failed_dial_marks_backend_inactive() {
        // grab a port nothing is listening on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let (backend, _tx) = test_backend(&format!("127.0.0.1:{}", port));
        backend.set_active(true);

        let err = backend.create_conn().await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Dial { .. } | ProxyError::DialTimeout { .. }
        ));
        assert!(!backend.is_active());
    }

    #[tokio::test]
    async fn test_successful_dial_returns_blocking_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (backend, _tx) = test_backend(&addr.to_string());

        let stream = backend.create_conn().await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }
}
