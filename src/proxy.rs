//! Top-level composite: wiring backends, applications, and frontends
//! together in configuration order and driving them until shutdown.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use crate::app::Application;
use crate::backend::Backend;
use crate::config::Config;
use crate::error::ProxyError;
use crate::frontend::Frontend;
use crate::pool::{BufferPool, PoolSnapshot};

/// The whole proxy: owns every application, frontend, backend, and the
/// shared buffer pool. Shutdown is signalled through the watch channel
/// whose receiver is handed in at construction.
#[derive(Debug)]
pub struct Proxy {
    apps: Vec<Arc<Application>>,
    frontends: Vec<Arc<Frontend>>,
    backends: Vec<Arc<Backend>>,
    buf_pool: Arc<BufferPool>,
}

impl Proxy {
    /// Build every component in configuration order. The first failure
    /// aborts construction and is returned as-is.
    pub fn new(config: &Config, shutdown: watch::Receiver<bool>) -> Result<Proxy, ProxyError> {
        config.validate()?;

        let buf_pool = Arc::new(BufferPool::new());
        let mut apps = Vec::with_capacity(config.apps.len());
        let mut frontends = Vec::new();
        let mut backends = Vec::new();

        for app_config in &config.apps {
            let mut app_backends = Vec::with_capacity(app_config.targets.len());
            for target in &app_config.targets {
                let backend = Backend::new(target, Arc::clone(&buf_pool), shutdown.clone())?;
                app_backends.push(backend);
            }
            backends.extend(app_backends.iter().cloned());

            let app = Application::new(&app_config.name, app_backends);

            for &port in &app_config.ports {
                let frontend =
                    Frontend::new(port, Arc::clone(&app), Arc::clone(&buf_pool), shutdown.clone())?;
                frontends.push(frontend);
            }
            apps.push(app);
        }

        Ok(Proxy {
            apps,
            frontends,
            backends,
            buf_pool,
        })
    }

    pub fn apps(&self) -> &[Arc<Application>] {
        &self.apps
    }

    pub fn frontends(&self) -> &[Arc<Frontend>] {
        &self.frontends
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn buf_pool(&self) -> &Arc<BufferPool> {
        &self.buf_pool
    }

    /// Run every backend and frontend, blocking until all of them have
    /// observed shutdown and finished closing.
    pub async fn run(&self) {
        let mut tasks = Vec::with_capacity(self.backends.len() + self.frontends.len());
        for backend in &self.backends {
            tasks.push(tokio::spawn(Arc::clone(backend).run()));
        }
        for frontend in &self.frontends {
            tasks.push(tokio::spawn(Arc::clone(frontend).run()));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Point-in-time counters for the diagnostics endpoint.
    pub fn stats(&self) -> ProxyStats {
        ProxyStats {
            apps: self
                .apps
                .iter()
                .map(|app| AppStats {
                    name: app.name().to_string(),
                    backends: app
                        .backends()
                        .iter()
                        .map(|backend| BackendStats {
                            addr: backend.addr().to_string(),
                            active: backend.is_active(),
                            connections: backend.connection_count(),
                        })
                        .collect(),
                })
                .collect(),
            frontends: self
                .frontends
                .iter()
                .map(|frontend| FrontendStats {
                    port: frontend.port(),
                    connections: frontend.connection_count(),
                })
                .collect(),
            pool: self.buf_pool.snapshot(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProxyStats {
    pub apps: Vec<AppStats>,
    pub frontends: Vec<FrontendStats>,
    pub pool: PoolSnapshot,
}

#[derive(Debug, Serialize)]
pub struct AppStats {
    pub name: String,
    pub backends: Vec<BackendStats>,
}

#[derive(Debug, Serialize)]
pub struct BackendStats {
    pub addr: String,
    pub active: bool,
    pub connections: usize,
}

#[derive(Debug, Serialize)]
pub struct FrontendStats {
    pub port: u16,
    pub connections: usize,
}
