//! Listening ports: accepting clients and assembling tunnels
//!
//! A frontend binds one TCP port for one application, accepts client
//! sockets, asks the application for a backend connection, and wires the
//! two halves of the tunnel into their connection tables.

use std::io;
use std::sync::{Arc, Once};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::app::Application;
use crate::conn::{Conn, ConnTable, TunnelLeg};
use crate::error::ProxyError;
use crate::pool::BufferPool;

/// Sleep between failed bind attempts
const BIND_RETRY_DELAY: Duration = Duration::from_secs(5);

/// One listening port bound to one application
#[derive(Debug)]
pub struct Frontend {
    port: u16,
    app: Arc<Application>,
    conns: Arc<ConnTable>,
    shutdown: watch::Receiver<bool>,
}

impl Frontend {
    pub fn new(
        port: u16,
        app: Arc<Application>,
        buf_pool: Arc<BufferPool>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Arc<Frontend>, ProxyError> {
        let conns = ConnTable::new(format!("frontend :{}", port), buf_pool, shutdown.clone())
            .map_err(ProxyError::Poller)?;
        Ok(Arc::new(Frontend {
            port,
            app,
            conns,
            shutdown,
        }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of request-direction legs currently tracked
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Drive the frontend until shutdown: bind (retrying), then accept loop
    /// plus readiness loop, then close the listener and every tracked
    /// socket.
    pub async fn run(self: Arc<Self>) {
        let listener = match self.bind().await {
            Some(listener) => listener,
            None => return,
        };
        info!(frontend = self.port, app = %self.app.name(), "listening");

        let poll = {
            let conns = Arc::clone(&self.conns);
            tokio::task::spawn_blocking(move || conns.poll_loop())
        };
        let accept = {
            let frontend = Arc::clone(&self);
            tokio::spawn(async move { frontend.accept_loop(listener).await })
        };

        let mut shutdown_rx = self.shutdown.clone();
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }

        info!(frontend = self.port, "closing listener and connections");
        self.conns.close_all();
        let _ = accept.await;
        let _ = poll.await;
    }

    /// Bind the listening socket, retrying every `BIND_RETRY_DELAY` until
    /// success or shutdown.
    async fn bind(&self) -> Option<TcpListener> {
        let mut shutdown_rx = self.shutdown.clone();
        loop {
            if *shutdown_rx.borrow() {
                return None;
            }
            match TcpListener::bind(("0.0.0.0", self.port)).await {
                Ok(listener) => return Some(listener),
                Err(e) => {
                    error!(frontend = self.port, error = %e, "bind failed, retrying");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(BIND_RETRY_DELAY) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return None;
                    }
                }
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!(frontend = self.port, connection = %peer, "accepted new connection");
                            let frontend = Arc::clone(&self);
                            tokio::spawn(async move {
                                frontend.handle_new_connection(stream).await;
                            });
                        }
                        Err(e) => {
                            info!(frontend = self.port, error = %e, "accept failed");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Wire one accepted client into a tunnel: dial a backend through the
    /// application, then create the two legs sharing one teardown token and
    /// register each with the table of the side it reads from. Dropping the
    /// client stream on any failure path closes it.
    async fn handle_new_connection(self: Arc<Self>, client: tokio::net::TcpStream) {
        let remote_conn = match self.app.create_remote_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(
                    frontend = self.port,
                    app = %self.app.name(),
                    error = %e,
                    "can't connect a backend"
                );
                return;
            }
        };

        let client_conn = match into_blocking(client)
            .and_then(|stream| Conn::new(stream, Arc::clone(&self.conns)))
        {
            Ok(conn) => conn,
            Err(e) => {
                debug!(frontend = self.port, error = %e, "client handle setup failed");
                remote_conn.close();
                return;
            }
        };

        let backend_table = Arc::clone(remote_conn.table());
        let once = Arc::new(Once::new());
        // client -> backend
        let request_leg = TunnelLeg::new(
            Arc::clone(&client_conn),
            Arc::clone(&remote_conn),
            Arc::clone(&once),
        );
        self.conns.add_conn(request_leg);
        // backend -> client
        let reply_leg = TunnelLeg::new(remote_conn, client_conn, once);
        backend_table.add_conn(reply_leg);
    }
}

/// Convert a tokio stream into a blocking-mode std stream for the copy path.
fn into_blocking(stream: tokio::net::TcpStream) -> io::Result<std::net::TcpStream> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    Ok(stream)
}
