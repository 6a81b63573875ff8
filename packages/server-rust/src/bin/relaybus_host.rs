//! `relaybus-host`: runs a service bus from a JSON settings file until Ctrl-C.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use relaybus_server::{
    DefaultMessageHandlerInvoker, HandlerContext, MessageHandler, ServiceBus, ServiceBusSettings,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Runs a RelayBus endpoint", long_about = None)]
struct Args {
    /// JSON settings file
    #[arg(short, long, env = "RELAYBUS_SETTINGS")]
    settings: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Log every received message of this type (repeatable)
    #[arg(long = "echo", value_name = "TYPE")]
    echo: Vec<String>,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "RELAYBUS_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

struct EchoHandler;

impl MessageHandler for EchoHandler {
    fn handle(&self, ctx: &HandlerContext<'_>) -> anyhow::Result<()> {
        let message = ctx.transport_message();
        info!(
            message_id = %message.message_id,
            message_type = %message.message_type,
            sender = message.sender_uri.as_deref().unwrap_or("-"),
            bytes = message.body.len(),
            "message received"
        );
        Ok(())
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    if let Some(addr) = args.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install prometheus exporter")?;
        info!(%addr, "metrics exporter listening");
    }

    let settings = ServiceBusSettings::from_file(&args.settings)
        .with_context(|| format!("failed to load {}", args.settings.display()))?;

    let invoker = Arc::new(DefaultMessageHandlerInvoker::new());
    let echo: Arc<dyn MessageHandler> = Arc::new(EchoHandler);
    for message_type in &args.echo {
        invoker.register_handler(message_type, Arc::clone(&echo));
    }

    let bus = ServiceBus::builder()
        .settings(settings)
        .handler_invoker(invoker)
        .build()?;
    bus.start()?;
    info!(settings = %args.settings.display(), "relaybus-host started; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    info!("shutdown requested");
    if let Err(e) = bus.stop() {
        tracing::warn!(error = %e, "bus did not stop cleanly");
    }
    bus.dispose();
    Ok(())
}
