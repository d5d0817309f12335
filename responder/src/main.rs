use clap::{Parser, Subcommand};
use log::info;
use responder::{GameServer, Responder, Role};
use shared::Player;
use std::net::Ipv4Addr;

#[derive(Parser, Debug)]
#[command(author, version, about = "Answers out-of-band queries as a master or game server", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:27960")]
    bind: String,

    #[command(subcommand)]
    role: RoleArgs,
}

#[derive(Subcommand, Debug)]
enum RoleArgs {
    /// Answer getservers with a fixed list
    Master {
        /// Listed server as IP:PORT (repeatable)
        #[arg(short, long = "server", value_parser = parse_server)]
        servers: Vec<(Ipv4Addr, u16)>,
    },
    /// Answer getinfo and getstatus
    Game {
        #[arg(long, default_value = "Responder")]
        hostname: String,

        #[arg(long, default_value = "ut4_abbey")]
        map: String,

        #[arg(long, default_value = "4")]
        gametype: String,

        /// Player as `FRAGS PING NAME` (repeatable)
        #[arg(short, long = "player", value_parser = parse_player)]
        players: Vec<Player>,
    },
}

fn parse_server(text: &str) -> Result<(Ipv4Addr, u16), String> {
    let (ip, port) = text
        .rsplit_once(':')
        .ok_or_else(|| format!("expected IP:PORT, got {:?}", text))?;
    let ip = ip.parse().map_err(|e| format!("bad ip in {:?}: {}", text, e))?;
    let port = port
        .parse()
        .map_err(|e| format!("bad port in {:?}: {}", text, e))?;
    Ok((ip, port))
}

fn parse_player(text: &str) -> Result<Player, String> {
    Player::parse(text).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let role = match args.role {
        RoleArgs::Master { servers } => {
            info!("Playing master server with {} listed servers", servers.len());
            Role::Master { servers }
        }
        RoleArgs::Game {
            hostname,
            map,
            gametype,
            players,
        } => {
            let server = players
                .into_iter()
                .fold(GameServer::new(&hostname, &map, &gametype), GameServer::with_player);
            info!("Playing game server {:?} on {}", hostname, map);
            Role::Game(server)
        }
    };

    let responder = Responder::bind(&args.bind, role).await?;

    tokio::select! {
        result = responder.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
