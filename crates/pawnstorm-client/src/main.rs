use anyhow::Context;
use clap::Parser;
use core::{fmt, time::Duration};
use pawnstorm_client::client::{
    config::{CliArgs, ClientConfig, Discovery, Mode, split_options},
    directory::{CatalogDirectory, Directory, StaticDirectory},
    orchestrator::{Orchestrator, TurnOutcome},
    telemetry::init_logging,
};
use pawnstorm_core::{
    Error,
    engine::{SearchEngine, UciConfig, UciEngine},
    game::{GameOutcome, GameState},
    options::EngineOption,
    shakmaty::{Color, File, Position, Rank, Square},
};
use std::{io::Write, path::PathBuf, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    signal,
};
use tokio_stream::{StreamExt, wrappers::LinesStream};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// How often a turn is retried while every worker is reconnecting.
const NO_WORKER_RETRIES: usize = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let CliArgs { cluster, mode } = CliArgs::parse();
    let config = ClientConfig::try_from(cluster)?;

    init_logging()?;
    log_startup_info(&config, &mode);

    let directory: Arc<dyn Directory> = match &config.discovery {
        Discovery::Catalog { url, role } => Arc::new(CatalogDirectory::new(
            url.clone(),
            role.clone(),
            config.orchestrator.ack_timeout,
        )?),
        Discovery::Static(entries) => Arc::new(StaticDirectory::new(entries.clone())),
    };

    let mut orchestrator = Orchestrator::new(config.orchestrator.clone(), directory);
    orchestrator
        .connect_all()
        .await
        .context("unable to connect to all workers")?;

    let played = tokio::select! {
        played = play_mode(&mut orchestrator, &config, mode) => played,
        () = shutdown_signal() => Ok(()),
    };

    if let Err(e) = &played {
        tracing::error!("Stopped: {e:#}");
    }
    orchestrator.shutdown().await;
    played
}

async fn play_mode(
    orchestrator: &mut Orchestrator,
    config: &ClientConfig,
    mode: Mode,
) -> anyhow::Result<()> {
    match mode {
        Mode::Play { black } => {
            let human = if black { Color::Black } else { Color::White };
            orchestrator
                .new_game(GameState::new(), &config.engine_options)
                .await?;
            play_human(orchestrator, human).await
        }
        Mode::Selfplay { plies } => {
            orchestrator
                .new_game(GameState::new(), &config.engine_options)
                .await?;
            selfplay(orchestrator, plies).await
        }
        Mode::Match {
            games,
            opponent,
            opponent_options,
            opponent_movetime_ms,
            max_plies,
        } => {
            let opponent_options = EngineOption::parse_all(&split_options(&opponent_options))
                .context("invalid OPPONENT_OPTIONS")?;
            let settings = MatchSettings {
                games,
                opponent,
                opponent_options,
                movetime: Duration::from_millis(opponent_movetime_ms),
                max_plies,
            };
            play_match(orchestrator, &config.engine_options, settings).await
        }
    }
}

/// Lets the cluster move, waiting out a short period where every
/// connection is down and reconnecting.
async fn cluster_move(orchestrator: &mut Orchestrator) -> pawnstorm_core::Result<TurnOutcome> {
    let mut waited = 0;
    loop {
        match orchestrator.run().await {
            Err(Error::NoReadyWorkers) if waited < NO_WORKER_RETRIES => {
                waited += 1;
                tracing::warn!(waited, "No worker is ready, waiting for reconnects");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            other => return other,
        }
    }
}

async fn play_human(orchestrator: &mut Orchestrator, human: Color) -> anyhow::Result<()> {
    let mut input = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());

    while !orchestrator.game().is_over() {
        if orchestrator.game().turn() != human {
            let turn = cluster_move(orchestrator).await?;
            println!("Cluster plays {} ({})", turn.best_move, describe_score(&turn));
            continue;
        }

        println!("{}", draw_board(orchestrator.game()));
        print!("Your move: ");
        std::io::stdout().flush()?;

        let Some(line) = input.next().await.transpose()? else {
            return Ok(());
        };
        let uci = line.trim();
        if uci == "quit" {
            println!("Game ended without a result");
            return Ok(());
        }
        if let Err(e) = orchestrator.play_move(uci) {
            println!("{e}");
            println!("Legal moves: {}", orchestrator.game().legal_moves().join(" "));
        }
    }

    println!("{}", draw_board(orchestrator.game()));
    let message = match (orchestrator.game().outcome(), human) {
        (GameOutcome::WhiteWon, Color::White) | (GameOutcome::BlackWon, Color::Black) => {
            "Checkmate. You won!"
        }
        (GameOutcome::WhiteWon | GameOutcome::BlackWon, _) => "Checkmate. You lost.",
        _ => "Draw.",
    };
    println!("{message}");
    Ok(())
}

async fn selfplay(orchestrator: &mut Orchestrator, plies: usize) -> anyhow::Result<()> {
    for ply in 0..plies {
        if orchestrator.game().is_over() {
            break;
        }
        let turn = cluster_move(orchestrator).await?;
        tracing::info!(
            ply,
            best_move = %turn.best_move,
            nodes = turn.nodes,
            responders = turn.responders,
            fallback = turn.fallback,
            "Selfplay move"
        );
    }

    println!("{}", draw_board(orchestrator.game()));
    println!(
        "{:?} after {} plies: {}",
        orchestrator.game().outcome(),
        orchestrator.game().history().len(),
        orchestrator.game().history().join(" ")
    );
    Ok(())
}

struct MatchSettings {
    games: usize,
    opponent: PathBuf,
    opponent_options: Vec<EngineOption>,
    movetime: Duration,
    max_plies: usize,
}

/// Win-draw-loss tally from the cluster's point of view.
#[derive(Debug, Default, Clone, Copy)]
struct Record {
    wins: usize,
    draws: usize,
    losses: usize,
}

impl Record {
    fn add(&mut self, outcome: GameOutcome, system: Color) {
        match (outcome, system) {
            (GameOutcome::WhiteWon, Color::White) | (GameOutcome::BlackWon, Color::Black) => {
                self.wins += 1;
            }
            (GameOutcome::WhiteWon | GameOutcome::BlackWon, _) => self.losses += 1,
            // Unfinished games are adjudicated as draws.
            (GameOutcome::Draw | GameOutcome::InProgress, _) => self.draws += 1,
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.wins, self.draws, self.losses)
    }
}

async fn play_match(
    orchestrator: &mut Orchestrator,
    engine_options: &[EngineOption],
    settings: MatchSettings,
) -> anyhow::Result<()> {
    let mut opponent = UciEngine::spawn(UciConfig::new(&settings.opponent))
        .await
        .with_context(|| format!("unable to start {}", settings.opponent.display()))?;
    opponent.configure(&settings.opponent_options).await?;

    let mut record = Record::default();
    for game in 0..settings.games {
        let system = if game % 2 == 0 {
            Color::Black
        } else {
            Color::White
        };
        opponent.new_game().await?;
        orchestrator.new_game(GameState::new(), engine_options).await?;

        let mut plies = 0;
        while !orchestrator.game().is_over() && plies < settings.max_plies {
            if orchestrator.game().turn() == system {
                let turn = cluster_move(orchestrator).await?;
                tracing::info!(
                    game,
                    ply = plies,
                    best_move = %turn.best_move,
                    nodes = turn.nodes,
                    responders = turn.responders,
                    "Cluster move"
                );
            } else {
                opponent.set_position(&orchestrator.game().fen()).await?;
                let reply = opponent.search_best_move(settings.movetime, &[]).await?;
                orchestrator.play_move(&reply.best_move)?;
                tracing::info!(
                    game,
                    ply = plies,
                    best_move = %reply.best_move,
                    nodes = reply.nodes,
                    "Opponent move"
                );
            }
            plies += 1;
        }

        let outcome = orchestrator.game().outcome();
        record.add(outcome, system);
        tracing::info!(game, plies, ?outcome, ?system, %record, "Game finished");
    }

    if let Err(e) = opponent.quit().await {
        tracing::warn!("Opponent did not quit cleanly: {e}");
    }
    println!(
        "Record against {}: {record}",
        settings.opponent.display()
    );
    Ok(())
}

fn describe_score(turn: &TurnOutcome) -> String {
    if turn.fallback {
        "no results, random move".to_owned()
    } else if turn.mate != 0 {
        format!("mate in {}", turn.mate)
    } else {
        format!("{} cp, {} nodes", turn.score, turn.nodes)
    }
}

fn draw_board(game: &GameState) -> String {
    let board = game.position().board();
    let mut out = String::new();
    for rank in Rank::ALL.into_iter().rev() {
        out.push(rank.char());
        for file in File::ALL {
            out.push(' ');
            out.push(
                board
                    .piece_at(Square::from_coords(file, rank))
                    .map_or('.', |piece| piece.char()),
            );
        }
        out.push('\n');
    }
    out.push_str("  a b c d e f g h");
    out
}

fn log_startup_info(config: &ClientConfig, mode: &Mode) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting {mode:?} with full config: {config:#?}");
    } else {
        tracing::info!(
            "Starting {:?} with {} workers named {}-NN",
            mode,
            config.orchestrator.num_workers,
            config.orchestrator.base_name
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}
