use clap::Parser;
use eyre::{Context, Result};
use std::time::Duration;
use transport::{CancellationToken, EchoServer, ServerConfig, Transport, TransportOptions};
use usrl::config::Config;

#[derive(Parser)]
#[command(name = "usrl-echo-server")]
#[command(about = "fixed-record tcp echo server, one thread per connection")]
#[command(version)]
struct Args {
    #[arg(help = "port to listen on [default: 8080]")]
    port: Option<u16>,

    #[arg(short, long, help = "configuration file path (toml format)")]
    config: Option<String>,

    #[arg(short, long, help = "size in bytes of every echoed record")]
    record_size: Option<usize>,

    #[arg(
        short,
        long,
        value_parser = humantime::parse_duration,
        help = "time in-flight connections get to finish on shutdown (e.g. 500ms, 2s)"
    )]
    grace: Option<Duration>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    usrl::init_tracing();

    let config = Config::load_or_default(args.config.as_deref())
        .with_context(|| format!("failed to load config path={:?}", args.config))?;
    let port = args.port.unwrap_or(config.server.port);
    let server_config = ServerConfig {
        record_size: args.record_size.unwrap_or(config.server.record_size),
        shutdown_grace: args.grace.unwrap_or(config.server.grace),
    };
    if server_config.record_size == 0 {
        eyre::bail!("record size must be non-zero");
    }

    let token = CancellationToken::new().with_context(|| "failed to create cancellation token")?;
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        tracing::info!("received termination signal, shutting down gracefully...");
        handler_token.cancel();
    })?;

    let options = TransportOptions::tcp_server(config.server.host.as_deref(), port);
    let listener = Transport::create(&options)
        .with_context(|| format!("failed to listen on port {port}"))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        record_size = server_config.record_size,
        "echo server listening"
    );

    let stats = EchoServer::new(server_config).serve(listener, &token)?;
    tracing::info!(
        accepted = stats.accepted,
        reaped = stats.reaped,
        terminated = stats.terminated,
        spawn_failures = stats.spawn_failures,
        "shutdown complete"
    );
    Ok(())
}
