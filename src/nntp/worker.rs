//! Per-connection socket task
//!
//! The downloader loop owns every decision; a worker only performs I/O for
//! one connection slot. It resolves and connects on start, runs the requests
//! it is sent one at a time and reports each result as a [`WorkerEvent`].
//! After any error the worker reports it and exits, dropping the socket.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::ClientConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::connection::{Connection, FetchReply};
use super::machine::Request;
use crate::bpsmeter::BpsMeter;
use crate::config::ServerConfig;
use crate::error::NntpError;
use crate::server::happy_eyeballs;
use crate::types::{ArticleRef, ServerId};

/// One article for a worker
#[derive(Debug, Clone)]
pub(crate) struct FetchRequest {
    /// Article being fetched
    pub article: ArticleRef,
    /// Wire request
    pub request: Request,
}

/// Instructions from the downloader
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    /// Run a request
    Fetch(FetchRequest),
    /// Log out and stop
    Quit,
}

/// Reports to the downloader
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    /// Session is up; `addr` is the address that answered
    Connected {
        server: ServerId,
        slot: usize,
        addr: SocketAddr,
    },
    /// A request completed
    Fetched {
        server: ServerId,
        slot: usize,
        article: ArticleRef,
        reply: FetchReply,
    },
    /// The connection failed and the worker stopped
    Failed {
        server: ServerId,
        slot: usize,
        article: Option<ArticleRef>,
        error: NntpError,
    },
}

/// Everything a worker needs to open its connection
#[derive(Debug, Clone)]
pub(crate) struct WorkerSpec {
    pub server: ServerId,
    pub slot: usize,
    pub config: ServerConfig,
    pub tls: Option<Arc<ClientConfig>>,
    /// Cached address; resolved with happy eyeballs when absent
    pub addr: Option<SocketAddr>,
}

/// Handle the downloader keeps per busy slot
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    pub commands: mpsc::UnboundedSender<WorkerCommand>,
    pub task: JoinHandle<()>,
}

/// Start a worker whose first job is `first`
pub(crate) fn spawn(
    spec: WorkerSpec,
    first: FetchRequest,
    bps: BpsMeter,
    events: mpsc::UnboundedSender<WorkerEvent>,
    shutdown: CancellationToken,
) -> WorkerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(server = %spec.server, slot = spec.slot, "worker dropped on shutdown");
            }
            _ = run(&spec, first, rx, &bps, &events) => {}
        }
    });
    WorkerHandle { commands: tx, task }
}

async fn run(
    spec: &WorkerSpec,
    first: FetchRequest,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    bps: &BpsMeter,
    events: &mpsc::UnboundedSender<WorkerEvent>,
) {
    let WorkerSpec { server, slot, .. } = *spec;
    let fail = |article: Option<ArticleRef>, error: NntpError| {
        let _ = events.send(WorkerEvent::Failed {
            server,
            slot,
            article,
            error,
        });
    };

    let addr = match spec.addr {
        Some(addr) => addr,
        None => match happy_eyeballs(&spec.config.host, spec.config.port, spec.config.timeout).await {
            Ok(addr) => addr,
            Err(e) => return fail(Some(first.article), e),
        },
    };
    let mut conn = match Connection::connect(server, addr, &spec.config, spec.tls.clone()).await {
        Ok(conn) => conn,
        Err(e) => return fail(Some(first.article), e),
    };
    let _ = events.send(WorkerEvent::Connected { server, slot, addr });

    let mut next = Some(first);
    loop {
        let fetch = match next.take() {
            Some(fetch) => fetch,
            None => match commands.recv().await {
                Some(WorkerCommand::Fetch(fetch)) => fetch,
                Some(WorkerCommand::Quit) | None => {
                    conn.quit().await;
                    debug!(%server, slot, "worker logged out");
                    return;
                }
            },
        };
        match conn.fetch(fetch.request, bps).await {
            Ok(reply) => {
                let _ = events.send(WorkerEvent::Fetched {
                    server,
                    slot,
                    article: fetch.article,
                    reply,
                });
            }
            Err(e) => return fail(Some(fetch.article), e),
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::nntp::Command;
    use crate::types::{FileId, JobId};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn article(index: u32) -> ArticleRef {
        ArticleRef {
            job: JobId(1),
            file: FileId(0),
            index,
        }
    }

    fn fetch(index: u32) -> FetchRequest {
        FetchRequest {
            article: article(index),
            request: Request {
                message_id: format!("part{index}@test"),
                group: None,
                command: Command::Stat,
            },
        }
    }

    async fn stub() -> (SocketAddr, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            write.write_all(b"200 stub\r\n").await.unwrap();
            let mut lines = BufReader::new(read).lines();
            let mut seen = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                let answer: &[u8] = if line == "QUIT" {
                    b"205 bye\r\n"
                } else {
                    b"223 0 <x> exists\r\n"
                };
                write.write_all(answer).await.unwrap();
                seen.push(line);
            }
            seen
        });
        (addr, task)
    }

    #[tokio::test]
    async fn worker_runs_requests_and_logs_out() {
        let (addr, server) = stub().await;
        let spec = WorkerSpec {
            server: ServerId(0),
            slot: 0,
            config: ServerConfig::new("stub", "127.0.0.1", addr.port()),
            tls: None,
            addr: Some(addr),
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn(spec, fetch(0), BpsMeter::new(0), tx, CancellationToken::new());

        assert!(matches!(rx.recv().await, Some(WorkerEvent::Connected { addr: a, .. }) if a == addr));
        match rx.recv().await {
            Some(WorkerEvent::Fetched { article: a, reply, .. }) => {
                assert_eq!(a, article(0));
                assert_eq!(reply, FetchReply::Present);
            }
            other => panic!("expected a result, got {other:?}"),
        }
        handle.commands.send(WorkerCommand::Fetch(fetch(1))).unwrap();
        assert!(matches!(rx.recv().await, Some(WorkerEvent::Fetched { .. })));
        handle.commands.send(WorkerCommand::Quit).unwrap();
        handle.task.await.unwrap();

        let seen = server.await.unwrap();
        assert_eq!(seen, vec!["STAT <part0@test>", "STAT <part1@test>", "QUIT"]);
    }

    #[tokio::test]
    async fn refused_connection_returns_the_article() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let spec = WorkerSpec {
            server: ServerId(3),
            slot: 1,
            config: ServerConfig::new("gone", "127.0.0.1", addr.port()),
            tls: None,
            addr: Some(addr),
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn(spec, fetch(7), BpsMeter::new(0), tx, CancellationToken::new());
        match rx.recv().await {
            Some(WorkerEvent::Failed {
                server,
                slot,
                article: a,
                error,
            }) => {
                assert_eq!((server, slot), (ServerId(3), 1));
                assert_eq!(a, Some(article(7)), "the claimed article is handed back");
                assert!(matches!(error, NntpError::Connect { .. }), "got {error:?}");
            }
            other => panic!("expected a failure, got {other:?}"),
        }
    }
}
