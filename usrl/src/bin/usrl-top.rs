use clap::Parser;
use eyre::{Context, Result};
use std::io::Write;
use std::time::Duration;
use transport::CancellationToken;
use usrl::config::Config;
use usrl::monitor::Monitor;

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

#[derive(Parser)]
#[command(name = "usrl-top")]
#[command(about = "live publish rates of every topic in a shared segment")]
#[command(version)]
struct Args {
    #[arg(short, long, help = "shared memory segment name [default: /usrl_core]")]
    segment: Option<String>,

    #[arg(
        short,
        long,
        value_parser = humantime::parse_duration,
        help = "refresh interval (e.g. 500ms, 1s)"
    )]
    interval: Option<Duration>,

    #[arg(short, long, help = "configuration file path (toml format)")]
    config: Option<String>,

    #[arg(long, help = "print one sample and exit")]
    once: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    usrl::init_tracing();

    let config = Config::load_or_default(args.config.as_deref())
        .with_context(|| format!("failed to load config path={:?}", args.config))?;
    let segment = args.segment.unwrap_or(config.monitor.segment);
    let interval = args.interval.unwrap_or(config.monitor.interval);

    let mut monitor = Monitor::open(&segment)
        .with_context(|| format!("could not open segment {segment}"))?;

    let token = CancellationToken::new()?;
    let handler_token = token.clone();
    ctrlc::set_handler(move || handler_token.cancel())?;

    while !token.wait_timeout(interval)? {
        let rows = monitor.sample();
        let table = monitor.render(&rows);
        if args.once {
            print!("{table}");
            break;
        }
        print!("{CLEAR_SCREEN}{table}\npress ctrl+c to exit\n");
        std::io::stdout().flush()?;
    }
    Ok(())
}
