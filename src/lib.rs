//! # telescope
//!
//! Records Twitch live streams the moment they start. `telescope` subscribes
//! to the platform's stream-changed webhooks, verifies and de-duplicates the
//! notifications it receives, and hands each live event to a handler, which
//! by default starts a capture worker driving `streamlink` and `ffmpeg`.
//!
//! Recordings that missed the start of a broadcast can be completed with the
//! [`stitch`] module, which records a head from the live stream or from an
//! archived playlist, aligns it against the first captured segment by audio
//! and concatenates everything. Archived broadcasts (playlist, muted-audio
//! table, chat replay) are handled by [`archive`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use telescope::{config, context::AppContext, gateway};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), telescope::error::Error> {
//!     let config = config::load(std::path::Path::new("telescope.toml"))?;
//!     let listener = tokio::net::TcpListener::bind(&config.listen).await?;
//!     let ctx = AppContext::new(config)?;
//!
//!     // Serve the webhook callbacks before subscribing
//!     let app = gateway::router(ctx.gateway());
//!     let server = tokio::spawn(async move { axum::serve(listener, app).await });
//!
//!     // Fetch an app token and subscribe to every configured channel
//!     ctx.start().await?;
//!
//!     server.await.map_err(|e| telescope::error::Error::Other(e.to_string()))??;
//!     ctx.shutdown().await;
//!     Ok(())
//! }
//! ```

#[forbid(unsafe_code)]
#[macro_use]
extern crate log;

pub mod archive;
pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod ffmpeg;
pub mod gateway;
pub mod handlers;
pub mod hls;
pub mod source;
pub mod stats;
pub mod stitch;
pub mod subscription;
pub mod twitch;
pub mod util;
pub mod worker;
