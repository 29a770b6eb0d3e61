//! Secure client driver
//!
//! [`ClientDriver::connect`] binds a UDP socket, sends the CLIENT_HELLO, and
//! starts the background receive thread; the application then drives
//! handshake retransmission, heartbeats, and the outbound message lifecycle
//! by calling [`ClientDriver::update`] from its own loop.
//!
//! Driver state is one sum type behind one mutex. Handshake scratch (the
//! ephemeral ECDH keypairs, the cached hello) lives only inside the
//! `WaitServerHello` variant and is consumed by the transition to `Ready`,
//! so no code path can touch it afterwards.

use crate::config::ClientConfig;
use crate::connection::{authenticate_message, drive_messages};
use crate::controller::{
    ControllerSet, MessageController, MessageData, MessageDataError, MessageDataErrorArgs,
    Notification, PacketFilter,
};
use crate::stats::{DriverStats, StatsInner};
use crate::DriverError;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use snp_crypto::{random_array, Certificate, EcdhKeyPair, MacKey, PublicCertificate, SessionKeys};
use snp_io::{NetSocket, SocketError, Timer};
use snp_protocol::handshake::{ClientHello, HandshakeError, ServerHello};
use snp_protocol::message::{CompletionFn, Message, MessageKind, SerializeContext};
use snp_protocol::packet::{
    build_ack, flags, parse_ack_data, HeaderFields, PacketBuilder, PacketType, PacketView,
    TransmitId, IV_SIZE,
};
use snp_protocol::replay::{ReplaySet, DEFAULT_REPLAY_WINDOW};
use snp_protocol::session::SessionId;
use snp_crypto::KEY_SIZE;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Receive buffer size; comfortably above the 1472-byte datagram ceiling.
const RECV_BUFFER: usize = 2048;

enum ClientState {
    /// CLIENT_HELLO sent, awaiting SERVER_HELLO
    WaitServerHello(Box<HandshakeState>),
    Ready(Box<ReadyState>),
    Disconnected,
    Failed,
}

struct HandshakeState {
    secret_keys: EcdhKeyPair,
    hmac_keys: EcdhKeyPair,
    /// One-time signing keypair; its public half travels in the hello and
    /// the server encrypts the SERVER_HELLO outer block to it
    sign_cert: Certificate,
    hello_wire: Bytes,
    hello_id: TransmitId,
    hello_acked: bool,
    retransmits_left: u32,
    last_send: Instant,
    started: Instant,
}

struct ReadyState {
    session_id: SessionId,
    keys: SessionKeys,
    /// Server's one-time signing key, recovered from the SERVER_HELLO
    server_sign: PublicCertificate,
    sign_cert: Certificate,
    last_traffic: Instant,
    heartbeat: Timer,
    /// Set when a heartbeat is in flight; cleared by any verified traffic
    heartbeat_pending: bool,
    messages: HashMap<u64, Message>,
    replay: ReplaySet,
}

struct ClientInner {
    config: ClientConfig,
    socket: NetSocket,
    running: AtomicBool,
    next_uid: AtomicU32,
    state: Mutex<ClientState>,
    /// Controller notifications produced on the receive thread, drained by
    /// the next update tick so callbacks only ever run there
    deferred: Mutex<Vec<Notification>>,
    controllers: ControllerSet,
    packet_filter: RwLock<Option<PacketFilter>>,
    stats: StatsInner,
}

/// Secure messaging client.
pub struct ClientDriver {
    inner: Arc<ClientInner>,
    recv_thread: Option<JoinHandle<()>>,
}

impl ClientDriver {
    /// Bind a socket, send the CLIENT_HELLO, and start the receive thread.
    ///
    /// Socket or crypto failures here are permanent: the caller must build a
    /// new driver to retry.
    pub fn connect(config: ClientConfig) -> Result<Self, DriverError> {
        let local = match config.server_addr {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = NetSocket::bind(local)?;

        let secret_keys = EcdhKeyPair::generate();
        let hmac_keys = EcdhKeyPair::generate();
        let sign_cert = Certificate::generate()?;
        let one_time_key: [u8; KEY_SIZE] = random_array();
        let one_time_iv: [u8; IV_SIZE] = random_array();

        let hello = ClientHello {
            one_time_key,
            one_time_iv,
            secret_public: secret_keys.public_bytes(),
            hmac_public: hmac_keys.public_bytes(),
            sign_public: sign_cert.public(),
        };
        let payload = hello.encode(&config.certificate)?;

        let fields = HeaderFields {
            app_id: config.app_id,
            app_version: config.app_version,
            flags: flags::RELIABLE,
            packet_type: PacketType::ClientHello,
            uid: 1,
            session_id: SessionId::EMPTY,
            iv: one_time_iv,
        };
        // No session keys exist yet: CRC and the server-certificate RSA
        // wrapping are the hello's only protection.
        let hello_wire = PacketBuilder::new(&fields).payload(&payload)?.seal(None);
        let hello_id = PacketView::new(&hello_wire)?.transmit_id();

        let state = Mutex::new(ClientState::WaitServerHello(Box::new(HandshakeState {
            secret_keys,
            hmac_keys,
            sign_cert,
            hello_wire: hello_wire.clone(),
            hello_id,
            hello_acked: false,
            retransmits_left: config.max_retransmit,
            last_send: Instant::now(),
            started: Instant::now(),
        })));

        tracing::info!(server = %config.server_addr, "client hello sent");
        let inner = Arc::new(ClientInner {
            config,
            socket,
            running: AtomicBool::new(true),
            next_uid: AtomicU32::new(2),
            state,
            deferred: Mutex::new(Vec::new()),
            controllers: ControllerSet::default(),
            packet_filter: RwLock::new(None),
            stats: StatsInner::default(),
        });
        inner.send_raw(&hello_wire);

        let thread_inner = Arc::clone(&inner);
        let recv_thread = thread::Builder::new()
            .name("snp-client-recv".into())
            .spawn(move || recv_loop(thread_inner))
            .map_err(SocketError::Io)?;

        Ok(ClientDriver {
            inner,
            recv_thread: Some(recv_thread),
        })
    }

    /// Advance timers and the outbound message lifecycle. Call regularly
    /// from the application loop; completion and controller callbacks fire
    /// synchronously here.
    pub fn update(&self) {
        self.inner.update();
    }

    /// Queue one message to the server. Serialization (encryption, signing,
    /// HMACs) happens now; transmission starts on the next update tick.
    pub fn send(
        &self,
        kind: MessageKind,
        options: u16,
        payload: Vec<u8>,
        on_success: Option<CompletionFn>,
        on_failed: Option<CompletionFn>,
    ) -> Result<TransmitId, DriverError> {
        let mut notifications = Vec::new();
        let result =
            self.inner
                .queue_message(kind, options, payload, on_success, on_failed, &mut notifications);
        self.inner
            .controllers
            .dispatch(notifications, &self.inner.stats);
        result
    }

    /// Send a best-effort disconnect, stop the receive thread, and notify
    /// controllers. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.recv_thread.take() else {
            return;
        };

        {
            let guard = self.inner.state.lock();
            if let ClientState::Ready(ready) = &*guard {
                let fields = HeaderFields {
                    app_id: self.inner.config.app_id,
                    app_version: self.inner.config.app_version,
                    flags: 0,
                    packet_type: PacketType::Disconnect,
                    uid: self.inner.next_uid(),
                    session_id: ready.session_id,
                    iv: [0u8; IV_SIZE],
                };
                if let Ok(stage) = PacketBuilder::new(&fields).payload(&[]) {
                    self.inner.send_raw(&stage.seal(Some(&ready.keys.hmac_key)));
                }
            }
        }

        self.inner.running.store(false, Ordering::Release);
        self.inner.socket.shutdown();
        let _ = handle.join();
        self.inner.controllers.notify_shutdown();
        tracing::info!("client driver shut down");
    }

    pub fn is_connected(&self) -> bool {
        matches!(&*self.inner.state.lock(), ClientState::Ready(_))
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(&*self.inner.state.lock(), ClientState::Disconnected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(&*self.inner.state.lock(), ClientState::Failed)
    }

    /// The server-assigned session id, once connected.
    pub fn session_id(&self) -> Option<SessionId> {
        match &*self.inner.state.lock() {
            ClientState::Ready(ready) => Some(ready.session_id),
            _ => None,
        }
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
}

impl Drop for ClientDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn recv_loop(inner: Arc<ClientInner>) {
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

impl ClientInner {
    fn next_uid(&self) -> u32 {
        self.next_uid.fetch_add(1, Ordering::Relaxed)
    }

    fn send_raw(&self, wire: &[u8]) {
        match self.socket.send_to(wire, self.config.server_addr) {
            Ok(n) => self.stats.record_send(n),
            Err(e) => tracing::warn!(error = %e, "send failed"),
        }
    }

    fn update(&self) {
        // Notifications collected on the receive thread are delivered here,
        // never there.
        let mut notifications = std::mem::take(&mut *self.deferred.lock());
        {
            let mut guard = self.state.lock();
            let prev = std::mem::replace(&mut *guard, ClientState::Failed);
            *guard = match prev {
                ClientState::WaitServerHello(hs) => self.update_wait_hello(hs, &mut notifications),
                ClientState::Ready(ready) => self.update_ready(ready, &mut notifications),
                terminal => terminal,
            };
        }
        self.controllers.dispatch(notifications, &self.stats);
    }

    fn update_wait_hello(
        &self,
        mut hs: Box<HandshakeState>,
        notifications: &mut Vec<Notification>,
    ) -> ClientState {
        if hs.started.elapsed() > self.config.max_heartbeat_delta {
            tracing::warn!("handshake timed out");
            notifications.push(Notification::Disconnect(SessionId::EMPTY));
            return ClientState::Failed;
        }
        if !hs.hello_acked && hs.last_send.elapsed() >= self.config.ack_timeout {
            if hs.retransmits_left > 0 {
                hs.retransmits_left -= 1;
                hs.last_send = Instant::now();
                self.stats.record_retransmit();
                self.send_raw(&hs.hello_wire);
                tracing::debug!(remaining = hs.retransmits_left, "client hello retransmitted");
            } else {
                tracing::warn!("client hello retransmits exhausted");
                notifications.push(Notification::Disconnect(SessionId::EMPTY));
                return ClientState::Failed;
            }
        }
        ClientState::WaitServerHello(hs)
    }

    fn update_ready(
        &self,
        mut ready: Box<ReadyState>,
        notifications: &mut Vec<Notification>,
    ) -> ClientState {
        if ready.last_traffic.elapsed() > self.config.max_heartbeat_delta {
            tracing::warn!(session_id = %ready.session_id, "server silent, disconnecting");
            notifications.push(Notification::Disconnect(ready.session_id));
            return ClientState::Disconnected;
        }

        if !ready.heartbeat_pending && ready.heartbeat.try_fire() {
            let fields = HeaderFields {
                app_id: self.config.app_id,
                app_version: self.config.app_version,
                flags: 0,
                packet_type: PacketType::Heartbeat,
                uid: self.next_uid(),
                session_id: ready.session_id,
                iv: [0u8; IV_SIZE],
            };
            if let Ok(stage) = PacketBuilder::new(&fields).payload(&[]) {
                self.send_raw(&stage.seal(Some(&ready.keys.hmac_key)));
                ready.heartbeat_pending = true;
            }
        }

        let sender = |wire: &[u8]| self.send_raw(wire);
        drive_messages(
            &mut ready.messages,
            self.config.ack_timeout,
            &sender,
            &self.stats,
            notifications,
        );
        ClientState::Ready(ready)
    }

    fn queue_message(
        &self,
        kind: MessageKind,
        options: u16,
        payload: Vec<u8>,
        on_success: Option<CompletionFn>,
        on_failed: Option<CompletionFn>,
        notifications: &mut Vec<Notification>,
    ) -> Result<TransmitId, DriverError> {
        let mut guard = self.state.lock();
        let ready = match &mut *guard {
            ClientState::Ready(ready) => ready,
            _ => return Err(DriverError::NotConnected),
        };

        let uid = self.next_uid();
        let mut msg = Message::new(
            kind,
            options,
            payload,
            self.config.max_retransmit,
            on_success,
            on_failed,
        );
        let ctx = SerializeContext {
            app_id: self.config.app_id,
            app_version: self.config.app_version,
            uid,
            session_id: ready.session_id,
            session_key: &ready.keys.session_key,
            hmac_key: &ready.keys.hmac_key,
            sign_cert: &ready.sign_cert,
        };
        if let Err(e) = msg.serialize(&ctx) {
            msg.fail();
            if let Some(callback) = msg.take_completion() {
                notifications.push(Notification::Completion(callback, TransmitId::EMPTY));
            }
            return Err(e.into());
        }
        let id = msg.transmit_id();
        msg.mark_registered();
        ready.messages.insert(id.as_raw(), msg);
        Ok(id)
    }

    /// Validation funnel for every inbound datagram. Rejections are counted
    /// and dropped with no further processing.
    fn process_packet(&self, buf: &[u8], addr: SocketAddr) {
        self.stats.record_recv(buf.len());

        if addr != self.config.server_addr {
            self.stats.drop_packet();
            return;
        }
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

        let mut notifications = Vec::new();
        {
            let mut guard = self.state.lock();
            let prev = std::mem::replace(&mut *guard, ClientState::Failed);
            *guard = match prev {
                ClientState::WaitServerHello(hs) => {
                    self.process_wait_hello(hs, packet_type, &view, &mut notifications)
                }
                ClientState::Ready(ready) => {
                    self.process_ready(ready, packet_type, &view, addr, &mut notifications)
                }
                terminal => {
                    self.stats.drop_packet();
                    terminal
                }
            };
        }
        if !notifications.is_empty() {
            self.deferred.lock().append(&mut notifications);
        }
    }

    fn process_wait_hello(
        &self,
        mut hs: Box<HandshakeState>,
        packet_type: PacketType,
        view: &PacketView<'_>,
        notifications: &mut Vec<Notification>,
    ) -> ClientState {
        match packet_type {
            // The server acks the hello before the SERVER_HELLO arrives;
            // stop retransmitting but keep waiting.
            PacketType::ClientHello if view.has_flag(flags::ACK) => {
                if parse_ack_data(view.data()) == Some(hs.hello_id) {
                    hs.hello_acked = true;
                }
                ClientState::WaitServerHello(hs)
            }
            PacketType::ServerHello if !view.has_flag(flags::ACK) => {
                // Anyone can spoof an unsigned hello; reject without state
                // change so the real one can still arrive.
                if !view.verify_signature(&self.config.certificate) {
                    tracing::warn!("server hello signature invalid");
                    self.stats.drop_packet();
                    return ClientState::WaitServerHello(hs);
                }
                match self.accept_server_hello(&hs, view) {
                    Ok(ready) => {
                        let ack = build_ack(
                            self.config.app_id,
                            self.config.app_version,
                            PacketType::ServerHello,
                            self.next_uid(),
                            ready.session_id,
                            view.transmit_id(),
                            Some(&ready.keys.hmac_key),
                        );
                        self.send_raw(&ack);
                        tracing::info!(session_id = %ready.session_id, "connected");
                        notifications.push(Notification::Connect(ready.session_id));
                        ClientState::Ready(ready)
                    }
                    Err(e) => {
                        // Signature verified, so this came from the real
                        // server; a decode failure here is unrecoverable.
                        tracing::warn!(error = %e, "server hello rejected");
                        notifications.push(Notification::Disconnect(SessionId::EMPTY));
                        ClientState::Failed
                    }
                }
            }
            _ => {
                self.stats.drop_packet();
                ClientState::WaitServerHello(hs)
            }
        }
    }

    fn accept_server_hello(
        &self,
        hs: &HandshakeState,
        view: &PacketView<'_>,
    ) -> Result<Box<ReadyState>, DriverError> {
        let outer = ServerHello::decode_outer(view.data(), &hs.sign_cert)?;
        // The embedded IV must match the header IV, or the data region was
        // spliced onto a different header.
        if outer.reply_iv != view.iv() {
            return Err(HandshakeError::Malformed("reply iv mismatch").into());
        }
        let session_key = hs.secret_keys.derive(&outer.secret_public);
        let inner = ServerHello::decode_inner(view.data(), &session_key, &outer.reply_iv)?;
        let hmac_key = MacKey::new(hs.hmac_keys.derive(&inner.hmac_public));

        Ok(Box::new(ReadyState {
            session_id: inner.session_id,
            keys: SessionKeys {
                session_key,
                hmac_key,
            },
            server_sign: inner.sign_public,
            sign_cert: hs.sign_cert.clone(),
            last_traffic: Instant::now(),
            heartbeat: Timer::new(self.config.heartbeat_interval),
            heartbeat_pending: false,
            messages: HashMap::new(),
            replay: ReplaySet::new(DEFAULT_REPLAY_WINDOW),
        }))
    }

    fn process_ready(
        &self,
        mut ready: Box<ReadyState>,
        packet_type: PacketType,
        view: &PacketView<'_>,
        addr: SocketAddr,
        notifications: &mut Vec<Notification>,
    ) -> ClientState {
        if !view.verify_header_hmac(&ready.keys.hmac_key) {
            match MessageKind::from_packet_type(packet_type) {
                Some(kind) => notifications.push(Notification::DataError(MessageDataErrorArgs {
                    session_id: ready.session_id,
                    kind,
                    uid: view.uid(),
                    peer: addr,
                    error: MessageDataError::InvalidHeaderHmac,
                })),
                None => self.stats.drop_packet(),
            }
            return ClientState::Ready(ready);
        }

        // Any verified server traffic counts as liveness.
        ready.last_traffic = Instant::now();
        ready.heartbeat_pending = false;

        if view.has_flag(flags::ACK) {
            if let Some(id) = parse_ack_data(view.data()) {
                if let Some(msg) = ready.messages.get_mut(&id.as_raw()) {
                    msg.acknowledge();
                }
            }
            return ClientState::Ready(ready);
        }

        match packet_type {
            PacketType::Disconnect => {
                tracing::info!(session_id = %ready.session_id, "server disconnected us");
                notifications.push(Notification::Disconnect(ready.session_id));
                ClientState::Disconnected
            }
            t if t.is_message() => {
                self.handle_message(&mut ready, view, addr, notifications);
                ClientState::Ready(ready)
            }
            _ => {
                self.stats.drop_packet();
                ClientState::Ready(ready)
            }
        }
    }

    fn handle_message(
        &self,
        ready: &mut ReadyState,
        view: &PacketView<'_>,
        addr: SocketAddr,
        notifications: &mut Vec<Notification>,
    ) {
        let packet_type = match view.packet_type() {
            Ok(t) => t,
            Err(_) => return,
        };
        let kind = match MessageKind::from_packet_type(packet_type) {
            Some(k) => k,
            None => return,
        };
        let reliable = view.has_flag(flags::RELIABLE);

        if !ready.replay.update(packet_type, view.transmit_id()) {
            self.stats.drop_duplicate();
            if reliable {
                self.send_raw(&build_ack(
                    self.config.app_id,
                    self.config.app_version,
                    packet_type,
                    self.next_uid(),
                    ready.session_id,
                    view.transmit_id(),
                    Some(&ready.keys.hmac_key),
                ));
            }
            return;
        }

        match authenticate_message(view, &ready.keys, &ready.server_sign) {
            Ok(payload) => {
                if reliable {
                    self.send_raw(&build_ack(
                        self.config.app_id,
                        self.config.app_version,
                        packet_type,
                        self.next_uid(),
                        ready.session_id,
                        view.transmit_id(),
                        Some(&ready.keys.hmac_key),
                    ));
                }
                notifications.push(Notification::Data(MessageData {
                    session_id: ready.session_id,
                    kind,
                    uid: view.uid(),
                    peer: addr,
                    payload,
                }));
            }
            Err(error) => {
                notifications.push(Notification::DataError(MessageDataErrorArgs {
                    session_id: ready.session_id,
                    kind,
                    uid: view.uid(),
                    peer: addr,
                    error,
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_hello_retransmit_exhaustion_fails() {
        let cert = Certificate::generate().unwrap();
        // Bound but never read: every hello disappears into the void.
        let sink = NetSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        let mut config = crate::config::ClientConfig::new(
            1,
            1,
            sink.local_addr().unwrap(),
            cert.public(),
        );
        config.ack_timeout = Duration::from_millis(10);
        config.max_retransmit = 1;

        let mut client = ClientDriver::connect(config).unwrap();
        for _ in 0..100 {
            client.update();
            if client.is_failed() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(client.is_failed());
        assert!(!client.is_connected());
        assert!(client.stats().retransmits >= 1);
        client.shutdown();
    }

    #[test]
    fn test_send_before_connected_rejected() {
        let cert = Certificate::generate().unwrap();
        let sink = NetSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let config =
            crate::config::ClientConfig::new(1, 1, sink.local_addr().unwrap(), cert.public());

        let client = ClientDriver::connect(config).unwrap();
        let result = client.send(MessageKind::Message, 0, b"too early".to_vec(), None, None);
        assert!(matches!(result, Err(DriverError::NotConnected)));
    }
}
