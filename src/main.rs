#[macro_use]
extern crate log;

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use telescope::{
    archive::Archive,
    config::{self, Config},
    context::AppContext,
    error::Error,
    ffmpeg::Ffmpeg,
    gateway, source,
    util::{self, HttpClient, HttpError},
    worker::CaptureSession,
};

#[derive(Parser)]
#[command(version, about = "Records Twitch streams as soon as they go live")]
struct Cli {
    /// Settings file
    #[arg(short, long, default_value = Config::default_path(), env = "TELESCOPE_CONFIG")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    logfile: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Subscribe to every configured channel and serve the webhook callbacks
    Serve,
    /// Subscribe to every configured channel and exit
    SubscribeAll,
    /// Print the subscriptions the platform currently holds for this app
    ListSubscriptions,
    /// Record a channel right now
    Capture { channel: String },
    /// Archive a broadcast from its media playlist
    Download {
        playlist_url: String,
        /// Base name of the files written
        #[arg(long)]
        name: Option<String>,
        /// Chat replay endpoint
        #[arg(long)]
        chat_url: Option<String>,
        #[arg(long)]
        thumbnail_url: Option<String>,
        /// Fetch the chat replay
        #[arg(long)]
        chat: bool,
        /// Fetch the thumbnail
        #[arg(long)]
        thumbnail: bool,
        #[command(flatten)]
        output: ArchiveOutput,
    },
    /// Continue an archive from a previous info dump
    Load {
        info: PathBuf,
        #[command(flatten)]
        output: ArchiveOutput,
    },
    /// Prepend the missing head of a broadcast to captured segments
    Stitch {
        /// Channel login, or the URL of an archived playlist
        source: String,
        /// Directory holding the captured segments
        #[arg(long)]
        segments: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Restore trimmed segments when the head comes from a playlist
        #[arg(long)]
        extended: bool,
    },
}

#[derive(Args)]
struct ArchiveOutput {
    /// Output directory
    #[arg(short, long, default_value = ".")]
    output: PathBuf,
    /// Only write the info dump and sidecars
    #[arg(long)]
    no_download: bool,
    /// Also write the raw and normalized playlists
    #[arg(long)]
    save_m3u8: bool,
    /// Restore trimmed segments while normalizing
    #[arg(long)]
    extended: bool,
    /// Overwrite existing files
    #[arg(long)]
    force: bool,
}

fn init_logging(debug: bool, logfile: Option<&Path>) -> std::io::Result<()> {
    let level = if debug { "debug" } else { "info" };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    if let Some(path) = logfile {
        builder.target(env_logger::Target::Pipe(Box::new(File::create(path)?)));
    }
    builder.init();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Could not listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

/// Archive commands only need the tool paths, so a missing config is fine.
fn archive_ffmpeg(path: &Path) -> Result<Ffmpeg, Error> {
    if !path.exists() {
        return Ok(Ffmpeg::default());
    }
    let config = config::load(path)?;
    Ok(Ffmpeg::new(&config.capture.ffmpeg, &config.capture.ffprobe))
}

async fn finish_archive(
    archive: &Archive,
    ffmpeg: &Ffmpeg,
    out: &ArchiveOutput,
    dump: bool,
) -> Result<(), Error> {
    tokio::fs::create_dir_all(&out.output).await?;
    if dump {
        archive.dump(&out.output, out.force).await?;
    }
    if out.save_m3u8 {
        let (raw, normalized) = archive
            .save_playlists(&out.output, out.extended, out.force)
            .await?;
        info!("Wrote {} and {}", raw.display(), normalized.display());
    }
    if !out.no_download {
        let path = archive
            .remux(ffmpeg, &out.output, out.extended, out.force)
            .await?;
        info!("Wrote {}", path.display());
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<(), Error> {
    match cli.command {
        Command::Serve => {
            let ctx = AppContext::new(config::load(&cli.config)?)?;
            let listener = tokio::net::TcpListener::bind(&ctx.config.listen).await?;
            info!("Listening on {}", ctx.config.listen);

            let app = gateway::router(ctx.gateway());
            let server = tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown_signal())
                    .await
            });

            ctx.start().await?;
            let served = server
                .await
                .map_err(|e| Error::Other(format!("Server task failed: {}", e)))?;
            ctx.shutdown().await;
            served?;
        }
        Command::SubscribeAll => {
            let ctx = AppContext::new(config::load(&cli.config)?)?;
            let outcome = ctx.start().await?;
            for key in &outcome.accepted {
                println!("accepted {}", key);
            }
            for (key, e) in &outcome.failed {
                println!("failed {}: {}", key, e);
            }
            // Subscriptions outlive this process; only the token goes.
            ctx.subscriptions.close();
            ctx.auth.revoke().await?;
        }
        Command::ListSubscriptions => {
            let ctx = AppContext::new(config::load(&cli.config)?)?;
            ctx.auth.authenticate().await?;
            let subscriptions = ctx.twitch.list_subscriptions().await;
            ctx.shutdown().await;
            println!(
                "{}",
                serde_json::to_string_pretty(&subscriptions?).map_err(|e| Error::Other(e.to_string()))?
            );
        }
        Command::Capture { channel } => {
            let ctx = AppContext::new(config::load(&cli.config)?)?;
            let capture = &ctx.config.capture;
            let login = channel.to_lowercase();
            tokio::fs::create_dir_all(&ctx.config.output_dir).await?;

            let session = CaptureSession {
                url: source::channel_url(&login),
                output: ctx.config.output_dir.join(format!(
                    "{}.{}",
                    util::timestamped_name(&login),
                    capture.container.extension()
                )),
                channel: login,
                qualities: capture.qualities.clone(),
                mode: capture.mode,
                container: capture.container,
            };
            info!("Recording {} to {}", session.channel, session.output.display());

            let supervisor = ctx.supervisor.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                supervisor.shutdown();
            });
            let stats = ctx.supervisor.start(session).wait().await?;
            println!("{}", stats.summary());
        }
        Command::Download {
            playlist_url,
            name,
            chat_url,
            thumbnail_url,
            chat,
            thumbnail,
            output,
        } => {
            let ffmpeg = archive_ffmpeg(&cli.config)?;
            let http = HttpClient::new().map_err(HttpError::from)?;

            let mut info = Map::new();
            if let Some(url) = chat_url {
                info.insert("chat_url".into(), Value::String(url));
            }
            if let Some(url) = thumbnail_url {
                info.insert("thumbnail_url".into(), Value::String(url));
            }
            let name = name.unwrap_or_else(|| util::timestamped_name("vod"));

            let mut archive = Archive::fetch(&http, &playlist_url, &name, info).await?;
            if chat {
                archive.load_chat(&http).await?;
            }
            if thumbnail {
                tokio::fs::create_dir_all(&output.output).await?;
                if let Some(path) = archive
                    .load_thumbnail(&http, &output.output, output.force)
                    .await?
                {
                    info!("Wrote {}", path.display());
                }
            }
            finish_archive(&archive, &ffmpeg, &output, true).await?;
        }
        Command::Load { info, output } => {
            let ffmpeg = archive_ffmpeg(&cli.config)?;
            let archive = Archive::load(&info).await?;
            info!("Loaded {} from {}", archive.name, info.display());
            finish_archive(&archive, &ffmpeg, &output, false).await?;
        }
        Command::Stitch {
            source,
            segments,
            output,
            extended,
        } => {
            let ctx = AppContext::new(config::load(&cli.config)?)?;
            let output = output.unwrap_or_else(|| {
                ctx.config
                    .output_dir
                    .join(format!("{}.mts", util::timestamped_name("stitched")))
            });
            let stitcher = ctx.stitcher();

            let report = if source.starts_with("http://") || source.starts_with("https://") {
                let head = ctx.playlist_head(&source, extended);
                stitcher.stitch(&head, &segments, &output).await?
            } else {
                let head = ctx.live_head(&source);
                stitcher.stitch(&head, &segments, &output).await?
            };
            info!(
                "Stitched {} segments after a {:.3}s head into {}",
                report.tails.len(),
                report.outpoint - report.offset.seconds,
                output.display()
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(cli.debug, cli.logfile.as_deref()) {
        eprintln!("Could not open log file: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(cli).await {
        error!("{}", e);
        let mut source = std::error::Error::source(&e);
        while let Some(cause) = source {
            error!("  caused by: {}", cause);
            source = std::error::Error::source(cause);
        }
        std::process::exit(e.exit_code());
    }
}
