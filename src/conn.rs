//! Socket handles, tunnel legs, and the connection-table role
//!
//! A tunnel is a pair of legs sharing one teardown token: the request leg
//! reads from the client and writes to the backend, the reply leg does the
//! opposite. Each leg is tracked by the connection table of the side it
//! reads from, and every table drives its descriptors through its own
//! readiness poller. Whichever side detects end-of-stream first tears the
//! whole pair down exactly once.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, RwLock};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::pool::BufferPool;
use crate::poller::{Event, Poller};

/// A blocking-mode TCP socket with an idempotent close and a back-reference
/// to the connection table that tracks it.
#[derive(Debug)]
pub struct Conn {
    stream: TcpStream,
    fd: RawFd,
    peer: SocketAddr,
    local: SocketAddr,
    closed: AtomicBool,
    table: Arc<ConnTable>,
}

impl Conn {
    /// Wrap an accepted or dialed socket. The stream must already be in
    /// blocking mode.
    pub fn new(stream: TcpStream, table: Arc<ConnTable>) -> io::Result<Arc<Conn>> {
        let fd = stream.as_raw_fd();
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        Ok(Arc::new(Conn {
            stream,
            fd,
            peer,
            local,
            closed: AtomicBool::new(false),
            table,
        }))
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn table(&self) -> &Arc<ConnTable> {
        &self.table
    }

    /// Close the connection at the TCP level. Only the first call acts;
    /// blocked readers and writers are woken. The descriptor itself is
    /// released once the last reference to this handle drops.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Err(e) = self.stream.shutdown(Shutdown::Both) {
                debug!(fd = self.fd, peer = %self.peer, error = %e, "socket shutdown failed");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        (&self.stream).write_all(buf)
    }
}

/// One direction of a tunnel: a reading socket paired with the socket the
/// bytes are forwarded to. Both legs of a tunnel share one `Once`.
#[derive(Debug)]
pub struct TunnelLeg {
    reader: Arc<Conn>,
    writer: Arc<Conn>,
    under_io: AtomicBool,
    once: Arc<Once>,
}

impl TunnelLeg {
    pub fn new(reader: Arc<Conn>, writer: Arc<Conn>, once: Arc<Once>) -> Arc<TunnelLeg> {
        Arc::new(TunnelLeg {
            reader,
            writer,
            under_io: AtomicBool::new(false),
            once,
        })
    }

    /// Flip the serving flag, reporting whether the transition happened.
    /// A readiness event that observes `false` here is a duplicate of one
    /// already being served and must be dropped.
    pub fn set_under_io(&self, under_io: bool) -> bool {
        self.under_io
            .compare_exchange(!under_io, under_io, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Tear down the tunnel pair. Runs at most once no matter how many
    /// times it is invoked on either leg.
    pub fn teardown(&self) {
        let once = Arc::clone(&self.once);
        once.call_once(|| {
            debug!(
                from = %self.reader.peer_addr(),
                via = %self.reader.local_addr(),
                to = %self.writer.peer_addr(),
                "closing tunnel pair"
            );
            self.finalize();
        });
    }

    fn finalize(&self) {
        self.under_io.store(false, Ordering::Release);
        self.reader.close();
        self.writer.close();
        self.writer.table().del_conn(self.writer.fd());
        self.reader.table().del_conn(self.reader.fd());
    }
}

/// The connection-manager role shared by frontends and backends: a map from
/// raw descriptor to tunnel leg, kept in lockstep with a readiness poller.
pub struct ConnTable {
    label: String,
    connections: RwLock<HashMap<RawFd, Arc<TunnelLeg>>>,
    poller: Poller,
    buf_pool: Arc<BufferPool>,
    shutdown: watch::Receiver<bool>,
}

impl ConnTable {
    pub fn new(
        label: impl Into<String>,
        buf_pool: Arc<BufferPool>,
        shutdown: watch::Receiver<bool>,
    ) -> io::Result<Arc<ConnTable>> {
        Ok(Arc::new(ConnTable {
            label: label.into(),
            connections: RwLock::new(HashMap::new()),
            poller: Poller::new()?,
            buf_pool,
            shutdown,
        }))
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Track a leg and register its reading descriptor with the poller, or
    /// close it right away when shutdown has begun. Map and poller mutate
    /// together under the write lock.
    pub fn add_conn(&self, leg: Arc<TunnelLeg>) {
        if self.shutting_down() {
            leg.reader.close();
            return;
        }
        let mut connections = self.connections.write().unwrap();
        let fd = leg.reader.fd();
        if let Err(e) = self.poller.add(fd) {
            warn!(table = %self.label, fd, error = %e, "failed to register descriptor");
            leg.reader.close();
            return;
        }
        connections.insert(fd, leg);
    }

    /// Stop tracking a descriptor. A no-op once shutdown has begun; the
    /// shutdown path closes everything itself.
    pub fn del_conn(&self, fd: RawFd) {
        if self.shutting_down() {
            return;
        }
        let mut connections = self.connections.write().unwrap();
        if let Err(e) = self.poller.delete(fd) {
            debug!(table = %self.label, fd, error = %e, "failed to deregister descriptor");
        }
        connections.remove(&fd);
    }

    pub fn conn_by_fd(&self, fd: RawFd) -> Option<Arc<TunnelLeg>> {
        self.connections.read().unwrap().get(&fd).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocking readiness loop; run it on the blocking pool. Exits once the
    /// poller is closed or shutdown is observed.
    pub fn poll_loop(self: &Arc<Self>) {
        loop {
            if self.shutting_down() {
                return;
            }
            let events = match self.poller.wait() {
                Ok(events) => events,
                Err(e) => {
                    if self.poller.is_closed() || self.shutting_down() {
                        return;
                    }
                    info!(table = %self.label, error = %e, "readiness wait failed");
                    continue;
                }
            };
            for event in events {
                self.serve_event(event);
            }
        }
    }

    /// Dispatch one readiness notification. Duplicate events for a leg that
    /// is already being served are dropped via the `under_io` flag; hangups
    /// and copy sessions go to the blocking pool so the readiness loop is
    /// never blocked.
    fn serve_event(self: &Arc<Self>, event: Event) {
        let Some(leg) = self.conn_by_fd(event.fd) else {
            return;
        };

        if !leg.set_under_io(true) {
            return;
        }

        if event.is_hangup() {
            debug!(table = %self.label, fd = event.fd, "hangup event");
            tokio::task::spawn_blocking(move || leg.teardown());
            return;
        }

        if event.is_readable() {
            let table = Arc::clone(self);
            tokio::task::spawn_blocking(move || table.serve_conn(leg));
        }
    }

    /// One copy session: forward bytes from the leg's reader to its writer
    /// until the reader yields zero bytes or errors. The sockets are in
    /// blocking mode, so end-of-stream or an error is the only way out.
    fn serve_conn(&self, leg: Arc<TunnelLeg>) {
        let mut buf = self.buf_pool.get();
        let result = copy_until_eof(&leg, &mut buf);
        self.buf_pool.put(buf);

        leg.set_under_io(false);

        match result {
            Ok(0) => {
                debug!(
                    table = %self.label,
                    from = %leg.reader.peer_addr(),
                    "peer closed"
                );
                leg.teardown();
            }
            Ok(_) => {}
            Err(e) => {
                info!(
                    table = %self.label,
                    from = %leg.reader.peer_addr(),
                    to = %leg.writer.peer_addr(),
                    error = %e,
                    "copy failed"
                );
                leg.teardown();
            }
        }
    }

    /// Shutdown path: release the poller, then close every tracked socket.
    /// No new entries can appear afterwards because `add_conn` checks the
    /// shutdown flag.
    pub fn close_all(&self) {
        self.poller.close();
        let connections = self.connections.read().unwrap();
        for leg in connections.values() {
            leg.reader.close();
        }
    }
}

// legs reference their table back, so keep Debug shallow
impl std::fmt::Debug for ConnTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnTable")
            .field("label", &self.label)
            .field("connections", &self.len())
            .finish_non_exhaustive()
    }
}

fn copy_until_eof(leg: &TunnelLeg, buf: &mut [u8]) -> io::Result<u64> {
    let mut total = 0u64;
    loop {
        let n = leg.reader.read(buf)?;
        if n == 0 {
            return Ok(total);
        }
        leg.writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}
