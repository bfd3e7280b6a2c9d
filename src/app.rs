//! Applications: named backend groups and the selection policy

use std::sync::Arc;

use crate::backend::Backend;
use crate::conn::Conn;
use crate::error::ProxyError;

/// A named logical service with one or more backends. Selection is
/// best-effort least-connections: counts are snapshots that may race with
/// concurrent tunnel setup and teardown on other backends.
#[derive(Debug)]
pub struct Application {
    name: String,
    backends: Vec<Arc<Backend>>,
}

impl Application {
    pub fn new(name: impl Into<String>, backends: Vec<Arc<Backend>>) -> Arc<Application> {
        Arc::new(Application {
            name: name.into(),
            backends,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Pick the active backend with the fewest live connections; ties go to
    /// the one listed first in the configuration.
    pub fn next_backend(&self) -> Result<Arc<Backend>, ProxyError> {
        let mut next: Option<&Arc<Backend>> = None;
        let mut min_count = 0usize;
        for backend in &self.backends {
            if !backend.is_active() {
                continue;
            }
            let count = backend.connection_count();
            if next.is_none() || count < min_count {
                next = Some(backend);
                min_count = count;
            }
        }
        next.cloned().ok_or(ProxyError::NoActiveBackend)
    }

    /// Select a backend and dial it, returning a socket handle owned by the
    /// chosen backend's connection table. A dial failure is returned as-is;
    /// no second backend is tried.
    pub async fn create_remote_connection(&self) -> Result<Arc<Conn>, ProxyError> {
        let backend = self.next_backend()?;
        let stream = backend.create_conn().await?;
        let conn = Conn::new(stream, Arc::clone(backend.conns()))?;
        Ok(conn)
    }
}
