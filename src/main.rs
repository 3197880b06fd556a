use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meeting_rtc::bots::{BotClient, BotKind, BotReply};
use meeting_rtc::config::Config;
use meeting_rtc::error::RecorderError;
use meeting_rtc::session::{Identity, MeetingSession, SessionHandle};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meeting-rtc", version, about = "Join a team meeting over WebRTC")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Join a meeting and stay until `leave` or Ctrl-C
    Join {
        #[arg(long)]
        meeting_id: i64,
        #[arg(long)]
        team_id: i64,
        #[arg(long)]
        user_id: i64,
        /// TOML config; defaults apply when missing
        #[arg(long, default_value = "meeting.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Command::Join {
            meeting_id,
            team_id,
            user_id,
            config,
        } => {
            let config = Config::load(&config).context("Failed to load config")?;
            let identity = Identity {
                user_id,
                meeting_id,
                team_id,
            };
            join(config, identity).await
        }
    }
}

async fn join(config: Config, identity: Identity) -> Result<()> {
    let bots = Arc::new(BotClient::new(&config.endpoints.bot_api, &config.bots)?);
    let sample_rate = config.media.sample_rate;
    let (session, handle) = MeetingSession::join(config, identity).await?;

    let stdin_handle = handle.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut words = line.split_whitespace();
            match (words.next(), words.next()) {
                (Some("leave"), _) => {
                    stdin_handle.leave();
                    break;
                }
                (Some("bot"), Some(kind)) => match kind.parse::<BotKind>() {
                    Ok(kind) => {
                        ask_bot(stdin_handle.clone(), bots.clone(), kind, sample_rate);
                    }
                    Err(e) => warn!("{}", e),
                },
                (None, _) => {}
                _ => warn!("Commands: `bot <summary|positive|negative|moya|loader>`, `leave`"),
            }
        }
    });

    let ctrl_c_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted; leaving the meeting");
            ctrl_c_handle.leave();
        }
    });

    session.run().await?;
    Ok(())
}

fn ask_bot(handle: SessionHandle, bots: Arc<BotClient>, kind: BotKind, sample_rate: u32) {
    tokio::spawn(async move {
        let Some(recorder) = handle.recorder() else {
            warn!("Recording is not running; bots are unavailable");
            return;
        };
        let segment = match recorder.try_retrieve().await {
            Ok(segment) => segment,
            Err(RecorderError::Busy) => {
                warn!("A recording is already being collected; try again shortly");
                return;
            }
            Err(e) => {
                error!("Could not collect the recording: {}", e);
                return;
            }
        };

        match bots
            .submit(kind, handle.identity().meeting_id, &segment, sample_rate)
            .await
        {
            Ok(Some(BotReply::Text { kind, text })) => println!("[{}] {}", kind.label(), text),
            Ok(Some(BotReply::Notes { text, note_ids })) => {
                println!("[{}] {} (notes {:?})", BotKind::Loader.label(), text, note_ids)
            }
            Ok(None) => {}
            Err(e) => error!("{} bot failed: {}", kind.label(), e),
        }
    });
}
