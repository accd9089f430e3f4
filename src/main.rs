//! bomberboy - headless host, client and server browser for the sample game

mod config;
mod game;

use anyhow::{bail, Result};
use bomberboy_client::{ClientSession, ConnectionState, QueryReply, ServerQuery};
use bomberboy_core::{Game, NetObjectExt};
use bomberboy_net::LayerFlags;
use bomberboy_server::HostSession;
use clap::{Args, Parser, Subcommand};
use config::GameConfig;
use game::{BCharacter, BPlayerController, GAME_VERSION};
use glam::IVec2;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "BomberBoy multiplayer sample", long_about = None)]
struct Cli {
    /// Session settings file
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host a session
    Host {
        #[command(flatten)]
        overrides: Overrides,
        /// Advertised server name
        #[arg(long)]
        name: Option<String>,
        /// Player slots
        #[arg(long)]
        max_players: Option<u16>,
    },
    /// Join a hosted session
    Join {
        /// Host address
        addr: SocketAddr,
        #[command(flatten)]
        overrides: Overrides,
        /// Display name
        #[arg(long)]
        name: Option<String>,
        /// Wander and drop bombs automatically, seeded for reproducibility
        #[arg(long)]
        bot: Option<u64>,
    },
    /// Ask a host for its name and player count
    Query {
        /// Host address
        addr: SocketAddr,
    },
    /// Measure the round trip to a host
    Ping {
        /// Host address
        addr: SocketAddr,
    },
    /// Write the effective settings back to the config file
    InitConfig {
        #[command(flatten)]
        overrides: Overrides,
    },
}

#[derive(Args, Debug)]
struct Overrides {
    /// Port shared by the stream and datagram sockets
    #[arg(long)]
    port: Option<u16>,
    /// Shared session password
    #[arg(long)]
    password: Option<String>,
    /// Stop after this many seconds
    #[arg(long)]
    seconds: Option<u64>,
}

impl Overrides {
    fn apply(&self, config: &mut GameConfig) {
        if let Some(port) = self.port {
            config.session.port = port;
        }
        if let Some(password) = &self.password {
            config.session.password = password.clone();
        }
        if let Some(seconds) = self.seconds {
            config.run_seconds = seconds;
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = GameConfig::load_from_path(&cli.config);
    info!("Starting bomberboy v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Host {
            overrides,
            name,
            max_players,
        } => {
            overrides.apply(&mut config);
            if let Some(name) = name {
                config.session.server_name = name;
            }
            if let Some(max_players) = max_players {
                config.session.max_players = max_players;
            }
            run_host(&config)
        }
        Command::Join {
            addr,
            overrides,
            name,
            bot,
        } => {
            overrides.apply(&mut config);
            if let Some(name) = name {
                config.session.player_name = name;
            }
            run_client(&config, addr, bot)
        }
        Command::Query { addr } => {
            let timeout = config.session.handshake_timeout();
            match ServerQuery::query(addr, GAME_VERSION, timeout)?.wait()? {
                QueryReply::Info(info) => {
                    let locked = if info.flags.contains(LayerFlags::PASSWORD) {
                        " (password)"
                    } else {
                        ""
                    };
                    println!(
                        "{}{locked}: {}/{} players",
                        info.server_name, info.players, info.max_players
                    );
                }
                reply => warn!(?reply, "Unexpected answer to a query"),
            }
            Ok(())
        }
        Command::Ping { addr } => {
            let timeout = config.session.handshake_timeout();
            match ServerQuery::ping(addr, GAME_VERSION, timeout)?.wait()? {
                QueryReply::Pong { round_trip } => println!("{addr}: {round_trip:.2?}"),
                reply => warn!(?reply, "Unexpected answer to a ping"),
            }
            Ok(())
        }
        Command::InitConfig { overrides } => {
            overrides.apply(&mut config);
            config.save_to_path(&cli.config)?;
            info!("Wrote {}", cli.config.display());
            Ok(())
        }
    }
}

fn deadline(config: &GameConfig) -> Option<Instant> {
    (config.run_seconds > 0).then(|| Instant::now() + Duration::from_secs(config.run_seconds))
}

fn run_host(config: &GameConfig) -> Result<()> {
    let mut game = game::new_game()?;
    let mut host = HostSession::new(config.session.clone());
    host.start(&mut game)?;
    game::start_round(&mut game)?;

    let tick = Duration::from_secs_f32(config.tick_seconds());
    let deadline = deadline(config);
    let mut players = 0;
    while deadline.map_or(true, |at| Instant::now() < at) {
        let started = Instant::now();
        host.update(&mut game);
        game::host_tick(&mut game, config.tick_seconds());

        if host.client_count() != players {
            players = host.client_count();
            info!(players, "Player count changed");
        }
        std::thread::sleep(tick.saturating_sub(started.elapsed()));
    }

    host.stop(&mut game);
    Ok(())
}

fn run_client(config: &GameConfig, addr: SocketAddr, bot: Option<u64>) -> Result<()> {
    let mut game = game::new_game()?;
    let mut session = ClientSession::new(config.session.clone());
    session.connect(addr, &game)?;

    let mut rng = bot.map(StdRng::seed_from_u64);
    let tick = Duration::from_secs_f32(config.tick_seconds());
    let deadline = deadline(config);
    let mut was_connected = false;
    let mut announced = false;
    let mut last_score = 0;
    while deadline.map_or(true, |at| Instant::now() < at) {
        let started = Instant::now();
        session.update(&mut game);
        match session.state() {
            ConnectionState::Disconnected => break,
            ConnectionState::Handshaking => {}
            ConnectionState::Connected { player_id } => {
                if !was_connected {
                    was_connected = true;
                    info!(player_id, "Joined");
                }
                if !announced {
                    announced = announce_ready(&mut game, player_id);
                }
                if let Some(rng) = rng.as_mut() {
                    drive_bot(&mut game, player_id, rng);
                }
                let score = own_score(&game, player_id);
                if score != last_score {
                    last_score = score;
                    info!(score, "Score changed");
                }
            }
        }
        game.tick(config.tick_seconds());
        std::thread::sleep(tick.saturating_sub(started.elapsed()));
    }

    if session.state() != ConnectionState::Disconnected {
        session.disconnect(&mut game);
    }
    match session.last_disconnect().and_then(|reason| reason.as_error()) {
        Some(err) if !was_connected => bail!("could not join {addr}: {err}"),
        Some(err) => warn!(%err, "Session ended"),
        None => {}
    }
    Ok(())
}

fn own_controller(game: &Game, player_id: u16) -> Option<bomberboy_core::ObjectId> {
    game.objects_of::<BPlayerController>()
        .into_iter()
        .find(|id| game.get(*id).is_some_and(|pc| pc.net().network_owner_id() == player_id))
}

/// Returns `false` until the own controller has been replicated.
fn announce_ready(game: &mut Game, player_id: u16) -> bool {
    let Some(id) = own_controller(game, player_id) else {
        return false;
    };
    let Some(pc) = game.object_mut::<BPlayerController>(id) else {
        return false;
    };
    if !pc.is_ready() {
        pc.set_ready(true);
    }
    true
}

fn own_score(game: &Game, player_id: u16) -> i32 {
    own_controller(game, player_id)
        .and_then(|id| game.object::<BPlayerController>(id))
        .map_or(0, BPlayerController::score)
}

fn drive_bot(game: &mut Game, player_id: u16, rng: &mut StdRng) {
    let Some(id) = game
        .objects_of::<BCharacter>()
        .into_iter()
        .find(|id| game.get(*id).is_some_and(|c| c.net().network_owner_id() == player_id))
    else {
        return;
    };
    let Some(character) = game.object_mut::<BCharacter>(id) else {
        return;
    };
    match rng.gen_range(0..40) {
        0 => {
            let tile = character.tile();
            character.call_rpc("PlaceBomb", (tile,));
        }
        1..=4 => {
            let direction = [IVec2::X, IVec2::NEG_X, IVec2::Y, IVec2::NEG_Y][rng.gen_range(0..4)];
            character.call_rpc("Step", (direction,));
        }
        _ => {}
    }
}
