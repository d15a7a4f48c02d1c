//! # usenet-engine
//!
//! The core of a Usenet binary downloader: NZB jobs go in, verified and
//! unpacked files come out.
//!
//! ## Pipeline
//!
//! - **Downloader** - one loop owns every server connection, hands articles
//!   to idle connections by server priority and fails articles over to
//!   backup servers
//! - **Decoder** - yEnc decoding and CRC32 checks on a worker pool
//! - **Assembler** - writes decoded segments to their offset in the target
//!   file and finishes jobs
//! - **Post-processor** - PAR2 verify/repair, extraction, cleanup, user
//!   script and the move to the completed folder
//!
//! Progress is reported as [`Event`]s; the queue survives restarts through
//! the admin directory.
//!
//! ## Quick Start
//!
//! ```no_run
//! use usenet_engine::{Config, Engine, JobOptions, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = ServerConfig::new("primary", "news.example.com", 563);
//!     server.ssl = true;
//!     server.username = Some("user".to_string());
//!     server.password = Some("pass".to_string());
//!
//!     let config = Config {
//!         servers: vec![server],
//!         ..Default::default()
//!     };
//!
//!     let engine = Engine::new(config).await?;
//!     engine.start()?;
//!
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("event: {event:?}");
//!         }
//!     });
//!
//!     engine
//!         .add_nzb_file("release.nzb".as_ref(), JobOptions::default())
//!         .await?;
//!     usenet_engine::run_with_shutdown(engine).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Assembler worker: segment writes and file finalization
mod assembler;
/// Bandwidth meter and limiter
pub mod bpsmeter;
/// Article payload cache with disk spill
pub mod cache;
/// Configuration types
pub mod config;
/// Completed-job history store
pub mod db;
/// yEnc decoding, CRC32 combination and the decoder workers
pub mod decoder;
/// Obfuscated filename detection
pub mod deobfuscation;
/// Unpacking RAR sets while the download runs
mod directunpack;
/// The downloader selector loop
mod downloader;
/// The root context and public engine handle
mod engine;
/// Error types
pub mod error;
/// Articles, files and jobs
pub mod job;
/// NNTP protocol and connections
pub mod nntp;
/// NZB parsing and release file naming
pub mod nzb;
/// PAR2 packets and the verify/repair tool
pub mod par2;
/// Admin directory files and `queue.sab`
pub mod persistence;
/// Post-processing of finished jobs
mod postproc;
/// External tool supervision
mod process;
/// The download queue
pub mod queue;
/// Timed downloader commands
mod scheduler;
/// Server state, penalties and address resolution
pub mod server;
/// Per-level record of servers that were tried
pub mod trylist;
/// Core types and events
pub mod types;
/// Path and file helpers
pub mod utils;

// Re-export commonly used types
pub use config::{Config, FileCollisionAction, PostProcess, ServerConfig};
pub use db::{Database, HistoryRecorder};
pub use engine::Engine;
pub use error::{
    DatabaseError, DecodeError, DownloadError, Error, NntpError, PostProcessError, Result,
};
pub use par2::{CliParityHandler, NoOpParityHandler, ParityHandler, RepairResult, VerifyResult};
pub use scheduler::ScheduledTask;
pub use types::{
    Event, HistoryEntry, JobId, JobOptions, JobSummary, Priority, QueueStats, ServerId, Stage,
    Status,
};

/// Run the engine until a termination signal arrives, then shut it down
///
/// - **Unix:** SIGTERM or SIGINT, falling back to whichever handler could be
///   registered
/// - **Other platforms:** Ctrl+C via `tokio::signal::ctrl_c()`
pub async fn run_with_shutdown(engine: Engine) -> Result<()> {
    wait_for_signal().await;
    engine.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // registration fails in some sandboxes
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                _ = sigint.recv() => tracing::info!("received SIGINT"),
            }
        }
        (Err(e), Ok(mut only)) | (Ok(mut only), Err(e)) => {
            tracing::warn!(error = %e, "one signal handler could not be registered");
            only.recv().await;
            tracing::info!("received termination signal");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "no signal handler registered, using ctrl_c");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received Ctrl+C"),
        Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl+C"),
    }
}
