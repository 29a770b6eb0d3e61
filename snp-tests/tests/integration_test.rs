//! End-to-end integration tests
//!
//! Each test runs a real client and server driver over localhost UDP and
//! drives both update loops from the test thread. Packet filters inject
//! loss to exercise the retransmission and duplicate-suppression paths.

use snp::{
    ClientConfig, ClientDriver, MessageController, MessageData, MessageDataErrorArgs,
    ServerConfig, ServerDriver,
};
use snp_crypto::{Certificate, PublicCertificate};
use snp_protocol::{flags, options, MessageKind, PacketType, PacketView};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const APP_ID: u16 = 0x5150;
const APP_VERSION: u16 = 2;

const ALL_OPTIONS: u16 = options::RELIABLE | options::ENCRYPT | options::SIGNED | options::HMAC;

/// Records every controller callback for later assertions.
#[derive(Default)]
struct CollectingController {
    messages: Mutex<Vec<MessageData>>,
    connects: AtomicU32,
    disconnects: AtomicU32,
    errors: AtomicU32,
}

impl MessageController for CollectingController {
    fn on_connect(&self, _session_id: snp_protocol::SessionId) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnect(&self, _session_id: snp_protocol::SessionId) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_message_data(&self, data: MessageData) {
        self.messages.lock().unwrap().push(data);
    }

    fn on_message_data_error(&self, _args: MessageDataErrorArgs) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

impl CollectingController {
    fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

fn server_config(certificate: Certificate) -> ServerConfig {
    let mut config = ServerConfig::new(
        APP_ID,
        APP_VERSION,
        "127.0.0.1:0".parse().unwrap(),
        certificate,
    );
    config.ack_timeout = Duration::from_millis(100);
    config
}

fn client_config(server_addr: SocketAddr, certificate: PublicCertificate) -> ClientConfig {
    let mut config = ClientConfig::new(APP_ID, APP_VERSION, server_addr, certificate);
    config.ack_timeout = Duration::from_millis(100);
    config
}

/// Pump both drivers until the condition holds or the timeout elapses.
fn pump_until<F: Fn() -> bool>(
    client: &ClientDriver,
    server: &ServerDriver,
    timeout: Duration,
    cond: F,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        client.update();
        server.update();
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn pump_server_until<F: Fn() -> bool>(server: &ServerDriver, timeout: Duration, cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        server.update();
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_connect_echo_and_disconnect() {
    let certificate = Certificate::generate().unwrap();
    let public = certificate.public();

    let server_ctl = Arc::new(CollectingController::default());
    let server = ServerDriver::bind(server_config(certificate)).unwrap();
    server.set_message_controller(MessageKind::Request, server_ctl.clone());
    let addr = server.local_addr().unwrap();

    let client_ctl = Arc::new(CollectingController::default());
    let mut client = ClientDriver::connect(client_config(addr, public)).unwrap();
    client.set_message_controller(MessageKind::Response, client_ctl.clone());

    assert!(
        pump_until(&client, &server, Duration::from_secs(30), || {
            client.is_connected() && server.connection_count() == 1
        }),
        "handshake did not complete"
    );

    let session_id = client.session_id().unwrap();
    assert!(server.find_connection(session_id).is_some());
    assert_eq!(server_ctl.connects.load(Ordering::SeqCst), 1);
    assert_eq!(client_ctl.connects.load(Ordering::SeqCst), 1);

    // Client -> server request, fully protected.
    let acked = Arc::new(AtomicU32::new(0));
    let acked_cb = acked.clone();
    client
        .send(
            MessageKind::Request,
            ALL_OPTIONS,
            b"ping".to_vec(),
            Some(Box::new(move |_| {
                acked_cb.fetch_add(1, Ordering::SeqCst);
            })),
            None,
        )
        .unwrap();

    assert!(
        pump_until(&client, &server, Duration::from_secs(10), || {
            server_ctl.message_count() == 1
        }),
        "request never arrived"
    );
    {
        let received = &server_ctl.messages.lock().unwrap()[0];
        assert_eq!(received.payload, b"ping");
        assert_eq!(received.kind, MessageKind::Request);
        assert_eq!(received.session_id, session_id);
    }

    // Server -> client response over the same connection.
    server
        .send(
            session_id,
            MessageKind::Response,
            ALL_OPTIONS,
            b"pong".to_vec(),
            None,
            None,
        )
        .unwrap();

    assert!(
        pump_until(&client, &server, Duration::from_secs(10), || {
            client_ctl.message_count() == 1
        }),
        "response never arrived"
    );
    assert_eq!(client_ctl.messages.lock().unwrap()[0].payload, b"pong");

    assert!(
        pump_until(&client, &server, Duration::from_secs(10), || {
            acked.load(Ordering::SeqCst) == 1
        }),
        "request was never acknowledged"
    );

    assert_eq!(server_ctl.errors.load(Ordering::SeqCst), 0);
    assert_eq!(client_ctl.errors.load(Ordering::SeqCst), 0);

    // A clean client shutdown tells the server, which fires on_disconnect
    // exactly once and forgets the connection.
    client.shutdown();
    assert!(
        pump_server_until(&server, Duration::from_secs(10), || {
            server_ctl.disconnects.load(Ordering::SeqCst) == 1 && server.connection_count() == 0
        }),
        "server never observed the disconnect"
    );
}

/// Remembers which thread each controller callback ran on.
#[derive(Default)]
struct ThreadRecorder {
    ids: Mutex<Vec<thread::ThreadId>>,
}

impl ThreadRecorder {
    fn record(&self) {
        self.ids.lock().unwrap().push(thread::current().id());
    }
}

impl MessageController for ThreadRecorder {
    fn on_connect(&self, _session_id: snp_protocol::SessionId) {
        self.record();
    }

    fn on_disconnect(&self, _session_id: snp_protocol::SessionId) {
        self.record();
    }

    fn on_message_data(&self, _data: MessageData) {
        self.record();
    }
}

#[test]
fn test_callbacks_fire_on_the_update_thread() {
    let certificate = Certificate::generate().unwrap();
    let public = certificate.public();

    let server_rec = Arc::new(ThreadRecorder::default());
    let server = ServerDriver::bind(server_config(certificate)).unwrap();
    server.set_message_controller(MessageKind::Request, server_rec.clone());
    let addr = server.local_addr().unwrap();

    let client_rec = Arc::new(ThreadRecorder::default());
    let mut client = ClientDriver::connect(client_config(addr, public)).unwrap();
    client.set_message_controller(MessageKind::Response, client_rec.clone());

    assert!(
        pump_until(&client, &server, Duration::from_secs(30), || {
            client.is_connected() && server.connection_count() == 1
        }),
        "handshake did not complete"
    );
    let session_id = client.session_id().unwrap();

    client
        .send(MessageKind::Request, ALL_OPTIONS, b"ping".to_vec(), None, None)
        .unwrap();
    server
        .send(
            session_id,
            MessageKind::Response,
            ALL_OPTIONS,
            b"pong".to_vec(),
            None,
            None,
        )
        .unwrap();

    let delivered = || {
        server_rec.ids.lock().unwrap().len() >= 2 && client_rec.ids.lock().unwrap().len() >= 2
    };
    assert!(
        pump_until(&client, &server, Duration::from_secs(10), delivered),
        "messages never arrived"
    );

    client.shutdown();
    assert!(
        pump_server_until(&server, Duration::from_secs(10), || {
            server.connection_count() == 0
        }),
        "server never observed the disconnect"
    );

    // Connect, data, and disconnect all came in on the receive thread, but
    // every callback must have run on this thread's update calls.
    let me = thread::current().id();
    let server_ids = server_rec.ids.lock().unwrap();
    assert!(server_ids.len() >= 3);
    assert!(server_ids.iter().all(|id| *id == me));
    let client_ids = client_rec.ids.lock().unwrap();
    assert!(client_ids.len() >= 2);
    assert!(client_ids.iter().all(|id| *id == me));
}

#[test]
fn test_handshake_survives_hello_loss() {
    let certificate = Certificate::generate().unwrap();
    let public = certificate.public();

    let server = ServerDriver::bind(server_config(certificate)).unwrap();
    let addr = server.local_addr().unwrap();

    // Drop the first two CLIENT_HELLO datagrams; the retransmit budget
    // (default 3) must carry the handshake through anyway.
    let dropped = Arc::new(AtomicU32::new(0));
    let dropped_filter = dropped.clone();
    server.set_packet_filter(Box::new(move |buf, _| {
        if let Ok(view) = PacketView::new(buf) {
            if matches!(view.packet_type(), Ok(PacketType::ClientHello))
                && !view.has_flag(flags::ACK)
                && dropped_filter.load(Ordering::SeqCst) < 2
            {
                dropped_filter.fetch_add(1, Ordering::SeqCst);
                return false;
            }
        }
        true
    }));

    let client = ClientDriver::connect(client_config(addr, public)).unwrap();
    assert!(
        pump_until(&client, &server, Duration::from_secs(30), || {
            client.is_connected()
        }),
        "handshake did not recover from hello loss"
    );
    assert_eq!(dropped.load(Ordering::SeqCst), 2);
    assert!(client.stats().retransmits >= 2);
    assert_eq!(server.connection_count(), 1);
}

#[test]
fn test_handshake_fails_when_hellos_never_arrive() {
    let certificate = Certificate::generate().unwrap();
    let public = certificate.public();

    let server = ServerDriver::bind(server_config(certificate)).unwrap();
    let addr = server.local_addr().unwrap();

    server.set_packet_filter(Box::new(|buf, _| {
        match PacketView::new(buf) {
            Ok(view) => !matches!(view.packet_type(), Ok(PacketType::ClientHello)),
            Err(_) => true,
        }
    }));

    let mut config = client_config(addr, public);
    config.ack_timeout = Duration::from_millis(50);
    config.max_retransmit = 2;
    config.max_heartbeat_delta = Duration::from_millis(500);

    let client_ctl = Arc::new(CollectingController::default());
    let client = ClientDriver::connect(config).unwrap();
    client.set_message_controller(MessageKind::Response, client_ctl.clone());

    assert!(
        pump_until(&client, &server, Duration::from_secs(10), || {
            client.is_failed()
        }),
        "client should have given up"
    );
    assert_eq!(client_ctl.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(server.connection_count(), 0);
    assert_eq!(server.stats().connections_accepted, 0);
}

#[test]
fn test_lost_ack_triggers_retransmit_but_single_delivery() {
    let certificate = Certificate::generate().unwrap();
    let public = certificate.public();

    let server_ctl = Arc::new(CollectingController::default());
    let server = ServerDriver::bind(server_config(certificate)).unwrap();
    server.set_message_controller(MessageKind::Request, server_ctl.clone());
    let addr = server.local_addr().unwrap();

    let client = ClientDriver::connect(client_config(addr, public)).unwrap();
    assert!(
        pump_until(&client, &server, Duration::from_secs(30), || {
            client.is_connected()
        }),
        "handshake did not complete"
    );

    // Swallow the first REQUEST ack on the client side. The client
    // retransmits; the server deduplicates and re-acks.
    let swallowed = Arc::new(AtomicBool::new(false));
    let swallowed_filter = swallowed.clone();
    client.set_packet_filter(Box::new(move |buf, _| {
        if let Ok(view) = PacketView::new(buf) {
            if matches!(view.packet_type(), Ok(PacketType::Request))
                && view.has_flag(flags::ACK)
                && !swallowed_filter.swap(true, Ordering::SeqCst)
            {
                return false;
            }
        }
        true
    }));

    let acked = Arc::new(AtomicU32::new(0));
    let acked_cb = acked.clone();
    client
        .send(
            MessageKind::Request,
            options::RELIABLE | options::HMAC,
            b"once only".to_vec(),
            Some(Box::new(move |_| {
                acked_cb.fetch_add(1, Ordering::SeqCst);
            })),
            None,
        )
        .unwrap();

    assert!(
        pump_until(&client, &server, Duration::from_secs(10), || {
            acked.load(Ordering::SeqCst) == 1
        }),
        "retransmitted request was never acknowledged"
    );
    assert!(swallowed.load(Ordering::SeqCst));
    assert_eq!(server_ctl.message_count(), 1);
    assert!(client.stats().retransmits >= 1);
    assert!(server.stats().dropped_duplicates >= 1);
}

#[test]
fn test_unacknowledged_message_fails_exactly_once() {
    let certificate = Certificate::generate().unwrap();
    let public = certificate.public();

    let server_ctl = Arc::new(CollectingController::default());
    let server = ServerDriver::bind(server_config(certificate)).unwrap();
    server.set_message_controller(MessageKind::Request, server_ctl.clone());
    let addr = server.local_addr().unwrap();

    let mut config = client_config(addr, public);
    config.ack_timeout = Duration::from_millis(50);
    config.max_retransmit = 1;
    let client = ClientDriver::connect(config).unwrap();
    assert!(
        pump_until(&client, &server, Duration::from_secs(30), || {
            client.is_connected()
        }),
        "handshake did not complete"
    );

    // No REQUEST ack ever reaches the client.
    client.set_packet_filter(Box::new(|buf, _| {
        match PacketView::new(buf) {
            Ok(view) => {
                !(matches!(view.packet_type(), Ok(PacketType::Request))
                    && view.has_flag(flags::ACK))
            }
            Err(_) => true,
        }
    }));

    let succeeded = Arc::new(AtomicU32::new(0));
    let failed = Arc::new(AtomicU32::new(0));
    let succeeded_cb = succeeded.clone();
    let failed_cb = failed.clone();
    client
        .send(
            MessageKind::Request,
            options::RELIABLE | options::HMAC,
            b"doomed".to_vec(),
            Some(Box::new(move |_| {
                succeeded_cb.fetch_add(1, Ordering::SeqCst);
            })),
            Some(Box::new(move |_| {
                failed_cb.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

    assert!(
        pump_until(&client, &server, Duration::from_secs(10), || {
            failed.load(Ordering::SeqCst) == 1
        }),
        "failure callback never fired"
    );
    assert_eq!(succeeded.load(Ordering::SeqCst), 0);

    // Delivery still happened once; only the acknowledgement was lost.
    assert_eq!(server_ctl.message_count(), 1);

    // The callback fires exactly once even as updates continue.
    pump_until(&client, &server, Duration::from_millis(300), || false);
    assert_eq!(failed.load(Ordering::SeqCst), 1);
}
