//! Secure server driver
//!
//! Owns the listening socket, accepts new sessions, and fans inbound
//! traffic out to the right [`ServerConnection`]. Admission is two-phase:
//! connections are created on the receive thread into a pending list under
//! its own lock, then published into the read-mostly lookup map on the next
//! update tick — steady-state packet routing only ever takes the read lock.

use crate::config::ServerConfig;
use crate::connection::ServerConnection;
use crate::controller::{ControllerSet, MessageController, Notification, PacketFilter};
use crate::stats::{DriverStats, StatsInner};
use crate::DriverError;
use parking_lot::{Mutex, RwLock};
use snp_io::{NetSocket, SocketError};
use snp_protocol::handshake::ClientHello;
use snp_protocol::message::{CompletionFn, MessageKind};
use snp_protocol::packet::{build_ack, flags, PacketType, PacketView, TransmitId};
use snp_protocol::replay::TransmitBuffer;
use snp_protocol::session::SessionId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Receive buffer size; comfortably above the 1472-byte datagram ceiling.
const RECV_BUFFER: usize = 2048;

/// Bounded retries for collision-checked session id allocation.
const SESSION_ID_RETRIES: usize = 10;

struct ServerInner {
    config: ServerConfig,
    socket: NetSocket,
    running: AtomicBool,
    next_uid: AtomicU32,
    /// Connections accepted on the receive thread, awaiting publication
    pending: Mutex<Vec<Arc<ServerConnection>>>,
    /// Published connections; the hot lookup path takes only the read lock
    connections: RwLock<HashMap<SessionId, Arc<ServerConnection>>>,
    /// Shared dedupe buffer so a retransmitted hello does not spawn a
    /// second session
    hello_dedupe: Mutex<TransmitBuffer>,
    /// Controller notifications produced on the receive thread, drained by
    /// the next update tick so callbacks only ever run there
    deferred: Mutex<Vec<Notification>>,
    controllers: ControllerSet,
    packet_filter: RwLock<Option<PacketFilter>>,
    stats: StatsInner,
}

/// Secure messaging server.
pub struct ServerDriver {
    inner: Arc<ServerInner>,
    recv_thread: Option<JoinHandle<()>>,
}

impl ServerDriver {
    /// Bind the listening socket and start the receive thread.
    pub fn bind(config: ServerConfig) -> Result<Self, DriverError> {
        let socket = NetSocket::bind(config.bind_addr)?;
        tracing::info!(addr = %socket.local_addr()?, "server listening");

        let replay_window = config.replay_window;
        let inner = Arc::new(ServerInner {
            config,
            socket,
            running: AtomicBool::new(true),
            next_uid: AtomicU32::new(1),
            pending: Mutex::new(Vec::new()),
            connections: RwLock::new(HashMap::new()),
            hello_dedupe: Mutex::new(TransmitBuffer::new(replay_window)),
            deferred: Mutex::new(Vec::new()),
            controllers: ControllerSet::default(),
            packet_filter: RwLock::new(None),
            stats: StatsInner::default(),
        });

        let thread_inner = Arc::clone(&inner);
        let recv_thread = thread::Builder::new()
            .name("snp-server-recv".into())
            .spawn(move || recv_loop(thread_inner))
            .map_err(SocketError::Io)?;

        Ok(ServerDriver {
            inner,
            recv_thread: Some(recv_thread),
        })
    }

    /// Publish pending connections, advance every connection's handshake /
    /// heartbeat / message lifecycle, and sweep dead connections. Controller
    /// callbacks fire synchronously here.
    pub fn update(&self) {
        // Data and error notifications collected on the receive thread are
        // delivered here, never there.
        let mut notifications = std::mem::take(&mut *self.inner.deferred.lock());

        // Publish: receive-thread admissions become visible to lookups.
        let fresh: Vec<Arc<ServerConnection>> = self.inner.pending.lock().drain(..).collect();
        if !fresh.is_empty() {
            let mut map = self.inner.connections.write();
            for conn in fresh {
                notifications.push(Notification::Connect(conn.session_id()));
                map.insert(conn.session_id(), conn);
            }
        }

        let live: Vec<Arc<ServerConnection>> =
            self.inner.connections.read().values().cloned().collect();
        for conn in &live {
            let peer = conn.peer();
            let sender = |wire: &[u8]| self.inner.send_raw(wire, peer);
            conn.update(&self.inner.config, &sender, &self.inner.stats, &mut notifications);
        }

        // Garbage pass: reap finished connections, notifying exactly once
        // (removal from the map is the once-guard).
        let dead: Vec<SessionId> = live
            .iter()
            .filter(|conn| conn.is_finished())
            .map(|conn| conn.session_id())
            .collect();
        if !dead.is_empty() {
            let mut map = self.inner.connections.write();
            for session_id in dead {
                if map.remove(&session_id).is_some() {
                    notifications.push(Notification::Disconnect(session_id));
                }
            }
        }

        self.inner
            .controllers
            .dispatch(notifications, &self.inner.stats);
    }

    /// Queue one message to a connected client.
    pub fn send(
        &self,
        session_id: SessionId,
        kind: MessageKind,
        options: u16,
        payload: Vec<u8>,
        on_success: Option<CompletionFn>,
        on_failed: Option<CompletionFn>,
    ) -> Result<TransmitId, DriverError> {
        let conn = self
            .find_connection(session_id)
            .ok_or(DriverError::NotConnected)?;
        let mut notifications = Vec::new();
        let result = conn.send_message(
            &self.inner.config,
            kind,
            options,
            payload,
            on_success,
            on_failed,
            &mut notifications,
        );
        self.inner
            .controllers
            .dispatch(notifications, &self.inner.stats);
        result
    }

    pub fn find_connection(&self, session_id: SessionId) -> Option<Arc<ServerConnection>> {
        self.inner.connections.read().get(&session_id).cloned()
    }

    /// Published connections only; pending admissions don't count yet.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DriverError> {
        Ok(self.inner.socket.local_addr()?)
    }

    pub fn stats(&self) -> DriverStats {
        self.inner.stats.snapshot()
    }

    pub fn set_message_controller(
        &self,
        kind: MessageKind,
        controller: Arc<dyn MessageController>,
    ) {
        self.inner.controllers.set(kind, controller);
    }

    /// Install a packet filter applied before any processing. Test hook for
    /// loss injection.
    pub fn set_packet_filter(&self, filter: PacketFilter) {
        *self.inner.packet_filter.write() = Some(filter);
    }

    /// Stop the receive thread and notify controllers. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.recv_thread.take() else {
            return;
        };
        self.inner.running.store(false, Ordering::Release);
        self.inner.socket.shutdown();
        let _ = handle.join();
        self.inner.controllers.notify_shutdown();
        tracing::info!("server driver shut down");
    }
}

impl Drop for ServerDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn recv_loop(inner: Arc<ServerInner>) {
    let mut buf = [0u8; RECV_BUFFER];
    while inner.running.load(Ordering::Acquire) {
        match inner.socket.recv_from(&mut buf) {
            Ok(Some((n, addr))) => {
                let filtered = match &*inner.packet_filter.read() {
                    Some(filter) => !filter(&buf[..n], addr),
                    None => false,
                };
                if filtered {
                    continue;
                }
                inner.process_packet(&buf[..n], addr);
            }
            Ok(None) => {}
            Err(e) => {
                if inner.running.load(Ordering::Acquire) {
                    tracing::warn!(error = %e, "receive failed");
                }
            }
        }
    }
}

impl ServerInner {
    fn next_uid(&self) -> u32 {
        self.next_uid.fetch_add(1, Ordering::Relaxed)
    }

    /// Stash receive-thread notifications for the next update tick.
    fn defer(&self, mut notifications: Vec<Notification>) {
        if !notifications.is_empty() {
            self.deferred.lock().append(&mut notifications);
        }
    }

    fn send_raw(&self, wire: &[u8], target: SocketAddr) {
        match self.socket.send_to(wire, target) {
            Ok(n) => self.stats.record_send(n),
            Err(e) => tracing::warn!(error = %e, %target, "send failed"),
        }
    }

    /// Validation funnel plus routing: hellos go to admission, everything
    /// else is routed by session id.
    fn process_packet(&self, buf: &[u8], addr: SocketAddr) {
        self.stats.record_recv(buf.len());

        let view = match PacketView::new(buf) {
            Ok(view) => view,
            Err(_) => {
                self.stats.drop_packet();
                return;
            }
        };
        if view.app_id() != self.config.app_id || view.app_version() != self.config.app_version {
            self.stats.drop_packet();
            return;
        }
        if !view.crc_valid() {
            self.stats.drop_packet();
            return;
        }
        let packet_type = match view.packet_type() {
            Ok(t) => t,
            Err(_) => {
                self.stats.drop_packet();
                return;
            }
        };

        if packet_type == PacketType::ClientHello && !view.has_flag(flags::ACK) {
            self.accept_connection(&view, addr);
            return;
        }

        let conn = self.connections.read().get(&view.session_id()).cloned();
        match conn {
            Some(conn) => {
                let peer = conn.peer();
                let sender = |wire: &[u8]| self.send_raw(wire, peer);
                let mut notifications = Vec::new();
                conn.process_packet(&view, &self.config, &sender, &self.stats, &mut notifications);
                self.defer(notifications);
            }
            None => {
                tracing::debug!(session_id = %view.session_id(), "packet for unknown session");
                self.stats.drop_packet();
            }
        }
    }

    /// CLIENT_HELLO admission: ack immediately (even for duplicates, since
    /// the client may have missed the first ack), dedupe, decode, allocate a
    /// session id, and stage the connection for publication.
    fn accept_connection(&self, view: &PacketView<'_>, addr: SocketAddr) {
        let ack = build_ack(
            self.config.app_id,
            self.config.app_version,
            PacketType::ClientHello,
            self.next_uid(),
            SessionId::EMPTY,
            view.transmit_id(),
            None,
        );
        self.send_raw(&ack, addr);

        if !self.hello_dedupe.lock().update(view.transmit_id()) {
            self.stats.drop_duplicate();
            return;
        }

        let hello = match ClientHello::decode(view.data(), &self.config.certificate) {
            Ok(hello) => hello,
            Err(e) => {
                tracing::warn!(error = %e, %addr, "client hello rejected");
                self.stats.drop_packet();
                return;
            }
        };

        let Some(session_id) = self.allocate_session_id() else {
            tracing::warn!(%addr, "session id allocation exhausted retries");
            self.stats.drop_packet();
            return;
        };

        match ServerConnection::accept(&self.config, session_id, addr, &hello) {
            Ok(conn) => {
                self.pending.lock().push(conn);
                self.stats.record_connection_accepted();
                tracing::info!(%session_id, %addr, "connection pending publication");
            }
            Err(e) => {
                tracing::warn!(error = %e, %addr, "connection setup failed");
                self.stats.drop_packet();
            }
        }
    }

    fn allocate_session_id(&self) -> Option<SessionId> {
        for _ in 0..SESSION_ID_RETRIES {
            let candidate = SessionId::generate();
            let taken = self.connections.read().contains_key(&candidate)
                || self
                    .pending
                    .lock()
                    .iter()
                    .any(|conn| conn.session_id() == candidate);
            if !taken {
                return Some(candidate);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snp_crypto::Certificate;

    #[test]
    fn test_bind_and_shutdown() {
        let cert = Certificate::generate().unwrap();
        let config = ServerConfig::new(1, 1, "127.0.0.1:0".parse().unwrap(), cert);
        let mut server = ServerDriver::bind(config).unwrap();

        assert_eq!(server.connection_count(), 0);
        assert!(server.local_addr().unwrap().port() > 0);
        server.update();
        server.shutdown();
        // Idempotent
        server.shutdown();
    }

    #[test]
    fn test_garbage_datagrams_counted() {
        let cert = Certificate::generate().unwrap();
        let config = ServerConfig::new(1, 1, "127.0.0.1:0".parse().unwrap(), cert);
        let server = ServerDriver::bind(config).unwrap();
        let addr = server.local_addr().unwrap();

        let probe = NetSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        probe.send_to(b"not a packet at all", addr).unwrap();

        for _ in 0..50 {
            if server.stats().dropped_packets >= 1 {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(server.stats().dropped_packets, 1);
    }
}
