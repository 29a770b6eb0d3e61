//! Server-side connection state machine
//!
//! One [`ServerConnection`] per accepted client. Created on the receive
//! thread when a CLIENT_HELLO decodes cleanly, published into the driver's
//! lookup map on the next update tick. The connection owns the derived
//! session keys, the cached SERVER_HELLO for retransmission, per-type replay
//! buffers, and the in-flight outbound messages for this client.
//!
//! All mutable state sits behind one mutex as a sum type per lifecycle
//! phase, so handshake scratch (the cached hello, its retransmit budget) is
//! structurally unreachable once the connection is ready.

use crate::config::ServerConfig;
use crate::controller::{MessageData, MessageDataError, MessageDataErrorArgs, Notification};
use crate::stats::StatsInner;
use crate::DriverError;
use bytes::Bytes;
use parking_lot::Mutex;
use snp_crypto::{cipher, Certificate, EcdhKeyPair, MacKey, PublicCertificate, SessionKeys};
use snp_protocol::handshake::{ClientHello, ServerHello};
use snp_protocol::message::{CompletionFn, Message, MessageKind, SerializeContext};
use snp_protocol::packet::{
    build_ack, flags, parse_ack_data, HeaderFields, PacketBuilder, PacketType, PacketView,
    TransmitId, IV_SIZE,
};
use snp_protocol::replay::ReplaySet;
use snp_protocol::session::SessionId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// AES block size; encrypted payloads are always a positive multiple.
const AES_BLOCK: usize = 16;

enum ConnectionState {
    /// SERVER_HELLO built, awaiting the client's ack (or first heartbeat)
    ServerHello(Box<ServerHandshake>),
    Ready(Box<ConnectionReady>),
    Disconnected,
    Failed,
}

struct ServerHandshake {
    /// Cached SERVER_HELLO wire bytes for retransmission
    wire: Bytes,
    hello_id: TransmitId,
    retransmits_left: u32,
    last_send: Option<Instant>,
    started: Instant,
    keys: SessionKeys,
    client_sign: PublicCertificate,
    own_sign: Certificate,
}

struct ConnectionReady {
    keys: SessionKeys,
    client_sign: PublicCertificate,
    own_sign: Certificate,
    last_traffic: Instant,
    messages: HashMap<u64, Message>,
    replay: ReplaySet,
}

/// One accepted client session on the server.
pub struct ServerConnection {
    session_id: SessionId,
    peer: SocketAddr,
    next_uid: AtomicU32,
    state: Mutex<ConnectionState>,
}

impl ServerConnection {
    /// Build a connection from a decoded CLIENT_HELLO: generate the server's
    /// ephemeral key material, derive the session keys, and cache the signed
    /// SERVER_HELLO. The hello goes on the wire on the next update tick,
    /// after the driver publishes this connection.
    pub(crate) fn accept(
        config: &ServerConfig,
        session_id: SessionId,
        peer: SocketAddr,
        hello: &ClientHello,
    ) -> Result<Arc<ServerConnection>, DriverError> {
        let secret_keys = EcdhKeyPair::generate();
        let hmac_keys = EcdhKeyPair::generate();
        let own_sign = Certificate::generate()?;

        let session_key = secret_keys.derive(&hello.secret_public);
        let hmac_key = MacKey::new(hmac_keys.derive(&hello.hmac_public));
        let reply_iv: [u8; IV_SIZE] = snp_crypto::random_array();

        let payload = ServerHello {
            reply_iv,
            secret_public: secret_keys.public_bytes(),
            hmac_public: hmac_keys.public_bytes(),
            sign_public: own_sign.public(),
            session_id,
        }
        .encode(&hello.sign_public, &session_key)?;

        let fields = HeaderFields {
            app_id: config.app_id,
            app_version: config.app_version,
            flags: flags::RELIABLE,
            packet_type: PacketType::ServerHello,
            uid: 1,
            session_id,
            iv: reply_iv,
        };
        // Signed with the long-lived server certificate; the client has no
        // session keys yet, so the header HMAC stays zero.
        let wire = PacketBuilder::new(&fields)
            .payload(&payload)?
            .sign(&config.certificate)?
            .seal(None);
        let hello_id = PacketView::new(&wire)?.transmit_id();

        tracing::debug!(%session_id, %peer, "connection accepted, server hello cached");

        Ok(Arc::new(ServerConnection {
            session_id,
            peer,
            next_uid: AtomicU32::new(2),
            state: Mutex::new(ConnectionState::ServerHello(Box::new(ServerHandshake {
                wire,
                hello_id,
                retransmits_left: config.max_retransmit,
                last_send: None,
                started: Instant::now(),
                keys: SessionKeys {
                    session_key,
                    hmac_key,
                },
                client_sign: hello.sign_public.clone(),
                own_sign,
            }))),
        }))
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.state.lock(), ConnectionState::Ready(_))
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(&*self.state.lock(), ConnectionState::Disconnected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(&*self.state.lock(), ConnectionState::Failed)
    }

    /// Terminal either way; the driver sweeps these.
    pub(crate) fn is_finished(&self) -> bool {
        matches!(
            &*self.state.lock(),
            ConnectionState::Disconnected | ConnectionState::Failed
        )
    }

    fn next_uid(&self) -> u32 {
        self.next_uid.fetch_add(1, Ordering::Relaxed)
    }

    /// Update-tick work: SERVER_HELLO (re)transmission, heartbeat-silence
    /// disconnect, and the outbound message lifecycle.
    pub(crate) fn update(
        &self,
        config: &ServerConfig,
        sender: &dyn Fn(&[u8]),
        stats: &StatsInner,
        notifications: &mut Vec<Notification>,
    ) {
        let mut guard = self.state.lock();
        let prev = std::mem::replace(&mut *guard, ConnectionState::Failed);
        *guard = match prev {
            ConnectionState::ServerHello(mut hs) => {
                if hs.started.elapsed() > config.max_heartbeat_delta {
                    tracing::warn!(session_id = %self.session_id, "handshake timed out");
                    ConnectionState::Failed
                } else {
                    match hs.last_send {
                        None => {
                            sender(&hs.wire);
                            hs.last_send = Some(Instant::now());
                            ConnectionState::ServerHello(hs)
                        }
                        Some(at) if at.elapsed() >= config.ack_timeout => {
                            if hs.retransmits_left > 0 {
                                hs.retransmits_left -= 1;
                                stats.record_retransmit();
                                sender(&hs.wire);
                                hs.last_send = Some(Instant::now());
                                ConnectionState::ServerHello(hs)
                            } else {
                                tracing::warn!(
                                    session_id = %self.session_id,
                                    "server hello retransmits exhausted"
                                );
                                ConnectionState::Failed
                            }
                        }
                        Some(_) => ConnectionState::ServerHello(hs),
                    }
                }
            }
            ConnectionState::Ready(mut ready) => {
                if ready.last_traffic.elapsed() > config.max_heartbeat_delta {
                    tracing::info!(session_id = %self.session_id, "heartbeat silence, disconnecting");
                    ConnectionState::Disconnected
                } else {
                    drive_messages(
                        &mut ready.messages,
                        config.ack_timeout,
                        sender,
                        stats,
                        notifications,
                    );
                    ConnectionState::Ready(ready)
                }
            }
            terminal => terminal,
        };
    }

    /// Route one validated inbound packet (header, app identity, and CRC
    /// already checked by the driver funnel).
    pub(crate) fn process_packet(
        &self,
        view: &PacketView<'_>,
        config: &ServerConfig,
        sender: &dyn Fn(&[u8]),
        stats: &StatsInner,
        notifications: &mut Vec<Notification>,
    ) {
        let packet_type = match view.packet_type() {
            Ok(t) => t,
            Err(_) => {
                stats.drop_packet();
                return;
            }
        };

        let mut guard = self.state.lock();
        let prev = std::mem::replace(&mut *guard, ConnectionState::Failed);
        *guard = match prev {
            ConnectionState::ServerHello(hs) => {
                self.process_handshake(hs, packet_type, view, config, sender, stats)
            }
            ConnectionState::Ready(ready) => self.process_ready(
                ready,
                packet_type,
                view,
                config,
                sender,
                stats,
                notifications,
            ),
            terminal => {
                stats.drop_packet();
                terminal
            }
        };
    }

    fn process_handshake(
        &self,
        hs: Box<ServerHandshake>,
        packet_type: PacketType,
        view: &PacketView<'_>,
        config: &ServerConfig,
        sender: &dyn Fn(&[u8]),
        stats: &StatsInner,
    ) -> ConnectionState {
        // Everything the client sends after deriving keys is HMAC'd.
        if !view.verify_header_hmac(&hs.keys.hmac_key) {
            stats.drop_packet();
            return ConnectionState::ServerHello(hs);
        }

        let hello_acked = packet_type == PacketType::ServerHello
            && view.has_flag(flags::ACK)
            && parse_ack_data(view.data()) == Some(hs.hello_id);
        let heartbeat = packet_type == PacketType::Heartbeat && !view.has_flag(flags::ACK);

        if !hello_acked && !heartbeat {
            stats.drop_packet();
            return ConnectionState::ServerHello(hs);
        }

        tracing::info!(session_id = %self.session_id, "handshake complete");
        let ServerHandshake {
            keys,
            client_sign,
            own_sign,
            ..
        } = *hs;
        let mut ready = Box::new(ConnectionReady {
            keys,
            client_sign,
            own_sign,
            last_traffic: Instant::now(),
            messages: HashMap::new(),
            replay: ReplaySet::new(config.replay_window),
        });

        // A first heartbeat both completes the handshake and wants an ack.
        if heartbeat {
            self.handle_heartbeat(&mut ready, view, config, sender, stats);
        }
        ConnectionState::Ready(ready)
    }

    #[allow(clippy::too_many_arguments)]
    fn process_ready(
        &self,
        mut ready: Box<ConnectionReady>,
        packet_type: PacketType,
        view: &PacketView<'_>,
        config: &ServerConfig,
        sender: &dyn Fn(&[u8]),
        stats: &StatsInner,
        notifications: &mut Vec<Notification>,
    ) -> ConnectionState {
        if !view.verify_header_hmac(&ready.keys.hmac_key) {
            match MessageKind::from_packet_type(packet_type) {
                Some(kind) => notifications.push(Notification::DataError(MessageDataErrorArgs {
                    session_id: self.session_id,
                    kind,
                    uid: view.uid(),
                    peer: self.peer,
                    error: MessageDataError::InvalidHeaderHmac,
                })),
                None => stats.drop_packet(),
            }
            return ConnectionState::Ready(ready);
        }

        ready.last_traffic = Instant::now();

        if view.has_flag(flags::ACK) {
            if let Some(id) = parse_ack_data(view.data()) {
                if let Some(msg) = ready.messages.get_mut(&id.as_raw()) {
                    msg.acknowledge();
                }
            }
            return ConnectionState::Ready(ready);
        }

        match packet_type {
            PacketType::Disconnect => {
                tracing::info!(session_id = %self.session_id, "client disconnected");
                ConnectionState::Disconnected
            }
            PacketType::Heartbeat => {
                self.handle_heartbeat(&mut ready, view, config, sender, stats);
                ConnectionState::Ready(ready)
            }
            t if t.is_message() => {
                self.handle_message(&mut ready, view, config, sender, stats, notifications);
                ConnectionState::Ready(ready)
            }
            _ => {
                stats.drop_packet();
                ConnectionState::Ready(ready)
            }
        }
    }

    /// Ack a heartbeat. Duplicates are counted but still acked, since a
    /// retransmitted heartbeat means the client missed our previous ack.
    fn handle_heartbeat(
        &self,
        ready: &mut ConnectionReady,
        view: &PacketView<'_>,
        config: &ServerConfig,
        sender: &dyn Fn(&[u8]),
        stats: &StatsInner,
    ) {
        if !ready.replay.update(PacketType::Heartbeat, view.transmit_id()) {
            stats.drop_duplicate();
        }
        let ack = build_ack(
            config.app_id,
            config.app_version,
            PacketType::Heartbeat,
            self.next_uid(),
            self.session_id,
            view.transmit_id(),
            Some(&ready.keys.hmac_key),
        );
        sender(&ack);
    }

    fn handle_message(
        &self,
        ready: &mut ConnectionReady,
        view: &PacketView<'_>,
        config: &ServerConfig,
        sender: &dyn Fn(&[u8]),
        stats: &StatsInner,
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
            stats.drop_duplicate();
            // Re-ack: the client is retransmitting because our ack was lost.
            if reliable {
                sender(&build_ack(
                    config.app_id,
                    config.app_version,
                    packet_type,
                    self.next_uid(),
                    self.session_id,
                    view.transmit_id(),
                    Some(&ready.keys.hmac_key),
                ));
            }
            return;
        }

        match authenticate_message(view, &ready.keys, &ready.client_sign) {
            Ok(payload) => {
                if reliable {
                    sender(&build_ack(
                        config.app_id,
                        config.app_version,
                        packet_type,
                        self.next_uid(),
                        self.session_id,
                        view.transmit_id(),
                        Some(&ready.keys.hmac_key),
                    ));
                }
                notifications.push(Notification::Data(MessageData {
                    session_id: self.session_id,
                    kind,
                    uid: view.uid(),
                    peer: self.peer,
                    payload,
                }));
            }
            Err(error) => {
                notifications.push(Notification::DataError(MessageDataErrorArgs {
                    session_id: self.session_id,
                    kind,
                    uid: view.uid(),
                    peer: self.peer,
                    error,
                }));
            }
        }
    }

    /// Serialize and register one outbound message for this client.
    pub(crate) fn send_message(
        &self,
        config: &ServerConfig,
        kind: MessageKind,
        options: u16,
        payload: Vec<u8>,
        on_success: Option<CompletionFn>,
        on_failed: Option<CompletionFn>,
        notifications: &mut Vec<Notification>,
    ) -> Result<TransmitId, DriverError> {
        let mut guard = self.state.lock();
        let ready = match &mut *guard {
            ConnectionState::Ready(ready) => ready,
            _ => return Err(DriverError::NotConnected),
        };

        let uid = self.next_uid();
        let mut msg = Message::new(kind, options, payload, config.max_retransmit, on_success, on_failed);
        let ctx = SerializeContext {
            app_id: config.app_id,
            app_version: config.app_version,
            uid,
            session_id: self.session_id,
            session_key: &ready.keys.session_key,
            hmac_key: &ready.keys.hmac_key,
            sign_cert: &ready.own_sign,
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
}

/// Authenticate and decrypt a message packet: header HMAC, then optional
/// signature, then optional data HMAC, then decryption. The first failing
/// layer names the error; the packet is never delivered partially checked.
pub(crate) fn authenticate_message(
    view: &PacketView<'_>,
    keys: &SessionKeys,
    peer_sign: &PublicCertificate,
) -> Result<Vec<u8>, MessageDataError> {
    if !view.verify_header_hmac(&keys.hmac_key) {
        return Err(MessageDataError::InvalidHeaderHmac);
    }
    if view.has_flag(flags::SIGNED) && !view.verify_signature(peer_sign) {
        return Err(MessageDataError::InvalidSignature);
    }
    if view.has_flag(flags::HMAC) && !view.verify_data_hmac(&keys.hmac_key) {
        return Err(MessageDataError::InvalidDataHmac);
    }
    if view.has_flag(flags::ENCRYPTED) {
        let data = view.data();
        if data.is_empty() || data.len() % AES_BLOCK != 0 {
            return Err(MessageDataError::DataRetrieval);
        }
        cipher::decrypt(&keys.session_key, &view.iv(), data)
            .map_err(|_| MessageDataError::Decryption)
    } else {
        Ok(view.data().to_vec())
    }
}

/// One update pass over a connection's in-flight messages: (re)send what is
/// due, fail what exhausted its budget, and sweep finished messages into
/// completion notifications.
pub(crate) fn drive_messages(
    messages: &mut HashMap<u64, Message>,
    ack_timeout: Duration,
    sender: &dyn Fn(&[u8]),
    stats: &StatsInner,
    notifications: &mut Vec<Notification>,
) {
    for msg in messages.values_mut() {
        if msg.should_send(ack_timeout) {
            if msg.mark_sent() {
                stats.record_retransmit();
            }
            sender(msg.wire());
        } else if msg.expired(ack_timeout) {
            msg.fail();
        }
    }

    messages.retain(|_, msg| {
        if msg.is_finished() {
            let id = msg.transmit_id();
            if let Some(callback) = msg.take_completion() {
                notifications.push(Notification::Completion(callback, id));
            }
            return false;
        }
        !msg.is_garbage()
    });
}
