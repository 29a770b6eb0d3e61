//! SNP Echo Client
//!
//! Connects to an SNP echo server, sends a batch of reliable messages and
//! waits for the echoed responses.

use clap::Parser;
use snp::{ClientConfig, ClientDriver, MessageController, MessageData, MessageDataErrorArgs};
use snp_cli::config::Config;
use snp_cli::display_stats;
use snp_crypto::PublicCertificate;
use snp_protocol::{options, MessageKind};
use std::fs;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "snp-echo-client")]
#[command(about = "SNP echo client", long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:7600")]
    server: SocketAddr,

    /// Path to the server's public certificate (DER)
    #[arg(short, long, default_value = "snp-server-cert.der")]
    cert: String,

    /// Application identifier
    #[arg(long, default_value = "1")]
    app_id: u16,

    /// Application version
    #[arg(long, default_value = "1")]
    app_version: u16,

    /// Message payload to send
    #[arg(short, long, default_value = "hello")]
    message: String,

    /// Number of messages to send
    #[arg(short = 'n', long, default_value = "10")]
    count: u32,

    /// Delay between messages in milliseconds
    #[arg(long, default_value = "100")]
    interval_ms: u64,

    /// Overall deadline in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Optional TOML configuration file (the [client] section overrides flags)
    #[arg(short = 'f', long)]
    config: Option<String>,
}

struct ResponseCounter {
    received: AtomicU32,
}

impl MessageController for ResponseCounter {
    fn on_message_data(&self, data: MessageData) {
        let n = self.received.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            "echo {} ({} bytes): {}",
            n,
            data.payload.len(),
            String::from_utf8_lossy(&data.payload)
        );
    }

    fn on_message_data_error(&self, args: MessageDataErrorArgs) {
        tracing::warn!(?args, "rejected response");
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt::init();

    let file_config = match &args.config {
        Some(path) => Some(
            Config::from_file(path)?
                .client
                .ok_or_else(|| anyhow::anyhow!("config file has no [client] section"))?,
        ),
        None => None,
    };
    let (server, app_id, app_version, cert_path) = match &file_config {
        Some(client) => (
            client.server,
            client.app_id,
            client.app_version,
            client.cert_path.clone(),
        ),
        None => (args.server, args.app_id, args.app_version, args.cert.clone()),
    };

    let der = fs::read(&cert_path)
        .map_err(|e| anyhow::anyhow!("failed to read certificate '{}': {}", cert_path, e))?;
    let certificate = PublicCertificate::from_der(&der)?;

    tracing::info!("connecting to {}", server);
    let mut config = ClientConfig::new(app_id, app_version, server, certificate);
    if let Some(file) = &file_config {
        file.apply(&mut config);
    }
    let mut client = ClientDriver::connect(config)?;

    let counter = Arc::new(ResponseCounter {
        received: AtomicU32::new(0),
    });
    client.set_message_controller(MessageKind::Response, counter.clone());

    let deadline = Instant::now() + Duration::from_secs(args.timeout);

    // Drive the handshake to completion.
    while !client.is_connected() {
        if client.is_failed() || client.is_disconnected() {
            anyhow::bail!("connection failed");
        }
        if Instant::now() > deadline {
            anyhow::bail!("timed out waiting for handshake");
        }
        client.update();
        thread::sleep(Duration::from_millis(10));
    }
    // Session id is present once connected.
    let session_id = client.session_id().unwrap();
    tracing::info!(%session_id, "connected");

    let succeeded = Arc::new(AtomicU32::new(0));
    let failed = Arc::new(AtomicU32::new(0));
    let send_options = options::RELIABLE | options::ENCRYPT | options::SIGNED | options::HMAC;

    let mut next_send = Instant::now();
    let mut sent = 0u32;
    loop {
        client.update();

        if sent < args.count && Instant::now() >= next_send {
            let payload = format!("{} #{}", args.message, sent + 1).into_bytes();
            let ok = succeeded.clone();
            let bad = failed.clone();
            client.send(
                MessageKind::Request,
                send_options,
                payload,
                Some(Box::new(move |_| {
                    ok.fetch_add(1, Ordering::SeqCst);
                })),
                Some(Box::new(move |id| {
                    bad.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!(?id, "message was not acknowledged");
                })),
            )?;
            sent += 1;
            next_send = Instant::now() + Duration::from_millis(args.interval_ms);
        }

        let done = counter.received.load(Ordering::SeqCst) + failed.load(Ordering::SeqCst);
        if sent == args.count && done >= args.count {
            break;
        }
        if client.is_disconnected() || client.is_failed() {
            tracing::error!("connection lost");
            break;
        }
        if Instant::now() > deadline {
            tracing::error!("deadline reached before all echoes arrived");
            break;
        }

        thread::sleep(Duration::from_millis(10));
    }

    tracing::info!(
        "sent={} acked={} failed={} echoed={}",
        sent,
        succeeded.load(Ordering::SeqCst),
        failed.load(Ordering::SeqCst),
        counter.received.load(Ordering::SeqCst)
    );
    tracing::info!("{}", display_stats(&client.stats()));

    client.shutdown();
    Ok(())
}
