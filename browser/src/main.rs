use browser::filter::parse_criterion;
use browser::{ConcurrencyMode, Filter, Registry, RegistryConfig, ServerSummary};
use clap::Parser;
use log::info;
use shared::{DEFAULT_MASTER_ADDRESS, MASTER_PORT};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Lists Urban Terror servers", long_about = None)]
struct Args {
    /// Master server host
    #[arg(short = 'm', long, default_value = DEFAULT_MASTER_ADDRESS)]
    master: String,

    #[arg(long, default_value_t = MASTER_PORT)]
    master_port: u16,

    /// Socket timeout and polling round length in milliseconds
    #[arg(short = 't', long, default_value = "1000")]
    timeout_ms: u64,

    /// Server to always include, as IP:PORT (repeatable)
    #[arg(short = 'f', long = "favorite", value_parser = parse_address)]
    favorites: Vec<(String, u16)>,

    /// Skip the master server and only poll favorites
    #[arg(long)]
    favorites_only: bool,

    #[arg(long)]
    no_cache: bool,

    /// Info field criterion as KEY=VALUE (repeatable, any one matches)
    #[arg(short = 'F', long = "filter", value_parser = parse_criterion)]
    filters: Vec<(String, String)>,

    /// Poll with one task per server instead of multiplexing
    #[arg(long)]
    per_server_tasks: bool,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn parse_address(text: &str) -> Result<(String, u16), String> {
    let (host, port) = text
        .rsplit_once(':')
        .ok_or_else(|| format!("expected IP:PORT, got {:?}", text))?;
    let port = port
        .parse()
        .map_err(|e| format!("bad port in {:?}: {}", text, e))?;
    Ok((host.to_string(), port))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = RegistryConfig::default()
        .with_master(args.master, args.master_port)
        .with_timeout(Duration::from_millis(args.timeout_ms))
        .with_favorites_only(args.favorites_only)
        .with_cache(!args.no_cache);

    let mut registry = Registry::new(config);
    for (ip, port) in args.favorites {
        registry.add_favorite(ip, port);
    }

    let filter: Filter = args.filters.into_iter().collect();
    let mode = if args.per_server_tasks {
        ConcurrencyMode::PerServerTask
    } else {
        ConcurrencyMode::Multiplexed
    };
    info!("Fetching servers ({:?}, {} criteria)", mode, filter.len());

    let summaries: Vec<ServerSummary> = registry
        .fetch(&filter, mode)
        .await
        .into_iter()
        .map(|server| server.summary())
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    for summary in &summaries {
        println!(
            "{:<21} {:<7} {:<20} {:>3}  {}",
            summary.address,
            summary.gametype,
            summary.map,
            summary.players.len(),
            summary.hostname
        );
    }
    println!("{} servers", summaries.len());

    Ok(())
}
