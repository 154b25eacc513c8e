use clap::Parser;
use eyre::{Context, Result};
use usrl::bench::{self, BenchConfig};
use usrl::config::Config;

#[derive(Parser)]
#[command(name = "usrl-bench")]
#[command(about = "multi-threaded tcp ping-pong load generator")]
#[command(version)]
struct Args {
    #[arg(help = "server host [default: 127.0.0.1]")]
    host: Option<String>,

    #[arg(help = "server port [default: 8080]")]
    port: Option<u16>,

    #[arg(help = "number of concurrent connections [default: 4]")]
    threads: Option<usize>,

    #[arg(short, long, help = "round trips per connection")]
    iterations: Option<u64>,

    #[arg(short, long, help = "payload size in bytes")]
    payload_size: Option<usize>,

    #[arg(short, long, help = "configuration file path (toml format)")]
    config: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    usrl::init_tracing();

    let config = Config::load_or_default(args.config.as_deref())
        .with_context(|| format!("failed to load config path={:?}", args.config))?;
    let bench_config = BenchConfig {
        host: args.host.unwrap_or(config.bench.host),
        port: args.port.unwrap_or(config.bench.port),
        threads: args.threads.unwrap_or(config.bench.threads),
        iterations: args.iterations.unwrap_or(config.bench.iterations),
        payload_size: args.payload_size.unwrap_or(config.bench.payload_size),
    };
    if bench_config.payload_size == 0 {
        eyre::bail!("payload size must be non-zero");
    }

    println!(
        "starting {} threads on {}:{} (payload: {})",
        bench_config.threads, bench_config.host, bench_config.port, bench_config.payload_size
    );
    let report = bench::run(&bench_config);
    println!("{report}");
    Ok(())
}
