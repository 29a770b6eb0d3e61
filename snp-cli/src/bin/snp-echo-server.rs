//! SNP Echo Server
//!
//! Accepts SNP connections and echoes every request back to its sender.

use clap::Parser;
use snp::{MessageController, MessageData, MessageDataErrorArgs, ServerConfig, ServerDriver};
use snp_cli::config::Config;
use snp_cli::display_stats;
use snp_crypto::Certificate;
use snp_protocol::{options, MessageKind, SessionId};
use std::fs;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "snp-echo-server")]
#[command(about = "SNP echo server", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:7600")]
    listen: SocketAddr,

    /// Application identifier
    #[arg(long, default_value = "1")]
    app_id: u16,

    /// Application version
    #[arg(long, default_value = "1")]
    app_version: u16,

    /// Where to write the public certificate (DER) for clients
    #[arg(short, long, default_value = "snp-server-cert.der")]
    cert_out: String,

    /// Statistics interval in seconds (0 disables)
    #[arg(long, default_value = "5")]
    stats: u64,

    /// Optional TOML configuration file (the [server] section overrides flags)
    #[arg(short = 'f', long)]
    config: Option<String>,
}

/// Forwards inbound requests to the main loop over a channel; controllers
/// run on the update thread and must not block.
struct EchoController {
    queue: mpsc::Sender<MessageData>,
}

impl MessageController for EchoController {
    fn on_connect(&self, session_id: SessionId) {
        tracing::info!(%session_id, "client connected");
    }

    fn on_disconnect(&self, session_id: SessionId) {
        tracing::info!(%session_id, "client disconnected");
    }

    fn on_message_data(&self, data: MessageData) {
        let _ = self.queue.send(data);
    }

    fn on_message_data_error(&self, args: MessageDataErrorArgs) {
        tracing::warn!(?args, "rejected message");
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt::init();

    let file_config = match &args.config {
        Some(path) => Some(
            Config::from_file(path)?
                .server
                .ok_or_else(|| anyhow::anyhow!("config file has no [server] section"))?,
        ),
        None => None,
    };
    let (listen, app_id, app_version, cert_out, stats_interval) = match &file_config {
        Some(server) => (
            server.listen,
            server.app_id,
            server.app_version,
            server.cert_path.clone(),
            server.stats_interval_secs,
        ),
        None => (
            args.listen,
            args.app_id,
            args.app_version,
            args.cert_out.clone(),
            args.stats,
        ),
    };

    tracing::info!("SNP echo server starting...");
    tracing::info!("generating server certificate (this takes a moment)");
    let certificate = Certificate::generate()?;
    fs::write(&cert_out, certificate.public().to_der()?)?;
    tracing::info!("public certificate written to {}", cert_out);

    let mut config = ServerConfig::new(app_id, app_version, listen, certificate);
    if let Some(file) = &file_config {
        file.apply(&mut config);
    }
    let server = ServerDriver::bind(config)?;
    tracing::info!("listening on {}", server.local_addr()?);

    let (tx, rx) = mpsc::channel();
    let controller = Arc::new(EchoController { queue: tx });
    server.set_message_controller(MessageKind::Message, controller.clone());
    server.set_message_controller(MessageKind::Request, controller);

    let mut last_stats = Instant::now();
    loop {
        server.update();

        while let Ok(data) = rx.try_recv() {
            tracing::debug!(
                session_id = %data.session_id,
                len = data.payload.len(),
                "echoing message"
            );
            let echo_options =
                options::RELIABLE | options::ENCRYPT | options::SIGNED | options::HMAC;
            if let Err(e) = server.send(
                data.session_id,
                MessageKind::Response,
                echo_options,
                data.payload,
                None,
                None,
            ) {
                tracing::error!("failed to queue echo: {}", e);
            }
        }

        if stats_interval > 0 && last_stats.elapsed() >= Duration::from_secs(stats_interval) {
            tracing::info!(
                "{} | connections={}",
                display_stats(&server.stats()),
                server.connection_count()
            );
            last_stats = Instant::now();
        }

        thread::sleep(Duration::from_millis(10));
    }
}
