//! NNTP client side
//!
//! - [`reply`]: status line parsing and the codes the engine reacts to
//! - [`machine`]: the session state machine, free of I/O
//! - [`connection`]: a session over TCP or TLS with timeouts and the
//!   bounded receive buffer
//! - `worker`: the task that runs one connection for the downloader

pub mod connection;
pub mod machine;
pub mod reply;
pub mod tls;
pub(crate) mod worker;

pub use connection::{Connection, FetchReply, MAX_BUFFER, NntpIo};
pub use machine::{Command, Machine, Request, Resolution, Step};
pub use reply::Reply;
pub use tls::build_tls_config;
