//! One NNTP session over TCP or TLS
//!
//! [`Connection`] drives a [`Machine`] with real I/O. The server timeout
//! runs from the last command sent until its answer is complete; data blocks are read into a buffer that grows
//! from 32 KiB in 16 KiB steps and fails once it would pass 1 MiB.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace};

use super::machine::{Machine, Request, Resolution, Step};
use super::reply::Reply;
use super::tls;
use crate::bpsmeter::BpsMeter;
use crate::config::ServerConfig;
use crate::error::NntpError;
use crate::types::ServerId;

/// Initial receive buffer
pub const INITIAL_BUFFER: usize = 32 * 1024;
/// Receive buffer growth step
pub const BUFFER_STEP: usize = INITIAL_BUFFER / 2;
/// Hard receive buffer ceiling
pub const MAX_BUFFER: usize = 1024 * 1024;

/// Time allowed for a polite `QUIT`
const QUIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Byte stream a session runs on
pub trait NntpIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> NntpIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Answer to one article request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchReply {
    /// Raw data block, dot-stuffed, terminator included
    Body(Vec<u8>),
    /// The article exists (STAT/HEAD)
    Present,
    /// The server does not have the article
    Missing,
    /// The server rejected the command itself
    NoCommand,
}

/// A logged-in session
pub struct Connection {
    stream: BufReader<Box<dyn NntpIo>>,
    machine: Machine,
    server: ServerId,
    timeout: Duration,
    /// When the answer to the last command must be complete
    deadline: Instant,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.server)
            .field("machine", &self.machine)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connect to `addr`, run the TLS handshake when configured and log in
    pub async fn connect(
        server: ServerId,
        addr: SocketAddr,
        config: &ServerConfig,
        tls_config: Option<Arc<ClientConfig>>,
    ) -> Result<Self, NntpError> {
        let tcp = tokio::time::timeout(config.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NntpError::Timeout)?
            .map_err(|e| NntpError::Connect {
                host: config.host.clone(),
                port: config.port,
                reason: e.to_string(),
            })?;
        let _ = tcp.set_nodelay(true);

        let io: Box<dyn NntpIo> = match tls_config {
            Some(tls_config) => {
                let handshake = tls::connect(tcp, &config.host, tls_config);
                let stream = tokio::time::timeout(config.timeout, handshake)
                    .await
                    .map_err(|_| NntpError::Timeout)??;
                Box::new(stream)
            }
            None => Box::new(tcp),
        };
        Self::login(server, io, config).await
    }

    /// Read the greeting and authenticate over an established stream
    pub async fn login(
        server: ServerId,
        io: Box<dyn NntpIo>,
        config: &ServerConfig,
    ) -> Result<Self, NntpError> {
        let mut conn = Self {
            stream: BufReader::new(io),
            machine: Machine::new(config.username.as_deref(), config.password.as_deref()),
            server,
            timeout: config.timeout,
            deadline: Instant::now() + config.timeout,
        };
        let greeting = conn.read_reply().await?;
        trace!(%server, %greeting, "greeting");
        let mut step = conn.machine.on_reply(&greeting);
        loop {
            match step {
                Step::Send(line) => {
                    conn.send(&line).await?;
                    let reply = conn.read_reply().await?;
                    step = conn.machine.on_reply(&reply);
                }
                Step::LoggedIn => {
                    debug!(%server, "logged in");
                    return Ok(conn);
                }
                Step::Failed(e) => return Err(e),
                Step::ReadData | Step::Resolved(_) => {
                    return Err(NntpError::Io("unexpected reply during login".into()));
                }
            }
        }
    }

    /// Run one request
    ///
    /// Received bytes pass through the meter's throttle and are counted
    /// against this server.
    pub async fn fetch(&mut self, request: Request, bps: &BpsMeter) -> Result<FetchReply, NntpError> {
        let command = request.command;
        let mut step = self.machine.request(request);
        loop {
            match step {
                Step::Send(line) => {
                    self.send(&line).await?;
                    let reply = self.read_reply().await?;
                    step = self.machine.on_reply(&reply);
                }
                Step::ReadData => {
                    let data = self.read_data(bps).await?;
                    self.machine.data_done();
                    return Ok(if command.wants_data() {
                        FetchReply::Body(data)
                    } else {
                        FetchReply::Present
                    });
                }
                Step::Resolved(resolution) => {
                    return Ok(match resolution {
                        Resolution::Present => FetchReply::Present,
                        Resolution::Missing => FetchReply::Missing,
                        Resolution::Unsupported => FetchReply::NoCommand,
                    });
                }
                Step::Failed(e) => return Err(e),
                Step::LoggedIn => return Err(NntpError::Io("request was dropped".into())),
            }
        }
    }

    /// Close the session, saying `QUIT` when the server expects it
    pub async fn quit(mut self) {
        if let Some(line) = self.machine.quit() {
            let _ = tokio::time::timeout(QUIT_TIMEOUT, self.send(line)).await;
        }
        let _ = self.stream.get_mut().shutdown().await;
    }

    async fn send(&mut self, line: &str) -> Result<(), NntpError> {
        if line.starts_with("AUTHINFO PASS") {
            trace!(server = %self.server, "> AUTHINFO PASS ****");
        } else {
            trace!(server = %self.server, "> {line}");
        }
        self.deadline = Instant::now() + self.timeout;
        let writer = self.stream.get_mut();
        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\r\n").await?;
            writer.flush().await
        };
        timeout_at(self.deadline, write)
            .await
            .map_err(|_| NntpError::Timeout)??;
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<Reply, NntpError> {
        let mut line = Vec::with_capacity(128);
        let n = timeout_at(self.deadline, self.stream.read_until(b'\n', &mut line))
            .await
            .map_err(|_| NntpError::Timeout)??;
        if n == 0 {
            return Err(NntpError::ConnectionClosed);
        }
        Reply::parse(&line).ok_or_else(|| {
            NntpError::Io(format!(
                "malformed status line {:?}",
                String::from_utf8_lossy(&line).trim_end()
            ))
        })
    }

    async fn read_data(&mut self, bps: &BpsMeter) -> Result<Vec<u8>, NntpError> {
        let mut buf = Vec::with_capacity(INITIAL_BUFFER);
        loop {
            if buf.len() == buf.capacity() {
                if buf.capacity() >= MAX_BUFFER {
                    return Err(NntpError::BufferOverflow { max: MAX_BUFFER });
                }
                buf.reserve_exact(BUFFER_STEP.min(MAX_BUFFER - buf.capacity()));
            }
            let n = timeout_at(self.deadline, self.stream.read_buf(&mut buf))
                .await
                .map_err(|_| NntpError::Timeout)??;
            if n == 0 {
                return Err(NntpError::ConnectionClosed);
            }
            // time spent in the bandwidth limiter is not the server's
            let throttled = Instant::now();
            bps.throttle(n as u64).await;
            self.deadline += throttled.elapsed();
            bps.record(self.server, n as u64);
            if is_terminated(&buf) {
                return Ok(buf);
            }
        }
    }
}

/// A data block ends with `.` alone on a line
fn is_terminated(buf: &[u8]) -> bool {
    buf == b".\r\n" || buf.ends_with(b"\r\n.\r\n")
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::nntp::Command;
    use tokio::io::{AsyncBufReadExt, DuplexStream};

    fn config(user: Option<&str>) -> ServerConfig {
        let mut config = ServerConfig::new("stub", "127.0.0.1", 119);
        config.username = user.map(str::to_string);
        config.password = user.map(|_| "pw".to_string());
        config.timeout = Duration::from_secs(5);
        config
    }

    /// Answer each received line with the next scripted reply
    fn serve(io: DuplexStream, greeting: &'static str, script: Vec<(&'static str, Vec<u8>)>) {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(io);
            let mut lines = BufReader::new(read).lines();
            write.write_all(greeting.as_bytes()).await.unwrap();
            for (expect, answer) in script {
                let line = lines.next_line().await.unwrap().unwrap();
                assert!(line.starts_with(expect), "expected {expect}, got {line}");
                write.write_all(&answer).await.unwrap();
            }
        });
    }

    fn body(id: &str) -> Request {
        Request {
            message_id: id.into(),
            group: None,
            command: Command::Body,
        }
    }

    #[tokio::test]
    async fn fetches_a_body_after_logging_in() {
        let (client, server) = tokio::io::duplex(1 << 16);
        serve(
            server,
            "200 welcome\r\n",
            vec![
                ("AUTHINFO USER joe", b"381 more\r\n".to_vec()),
                ("AUTHINFO PASS pw", b"281 ok\r\n".to_vec()),
                ("BODY <a@b>", b"222 body\r\nline one\r\n..dotted\r\n.\r\n".to_vec()),
                ("BODY <c@d>", b"430 no such article\r\n".to_vec()),
            ],
        );
        let bps = BpsMeter::new(0);
        let mut conn = Connection::login(ServerId(0), Box::new(client), &config(Some("joe")))
            .await
            .unwrap();
        let reply = conn.fetch(body("a@b"), &bps).await.unwrap();
        assert_eq!(
            reply,
            FetchReply::Body(b"line one\r\n..dotted\r\n.\r\n".to_vec()),
            "data is passed on raw"
        );
        assert_eq!(conn.fetch(body("c@d"), &bps).await.unwrap(), FetchReply::Missing);
        assert_eq!(bps.server_stats(ServerId(0)).bytes, 23, "body bytes are metered");
    }

    #[tokio::test]
    async fn bad_password_is_reported() {
        let (client, server) = tokio::io::duplex(1024);
        serve(
            server,
            "200 welcome\r\n",
            vec![
                ("AUTHINFO USER", b"381 more\r\n".to_vec()),
                ("AUTHINFO PASS", b"481 rejected\r\n".to_vec()),
            ],
        );
        let err = Connection::login(ServerId(0), Box::new(client), &config(Some("joe")))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            NntpError::Auth {
                code: 481,
                message: "rejected".into()
            }
        );
    }

    #[tokio::test]
    async fn oversized_body_overflows_the_buffer() {
        let (client, server) = tokio::io::duplex(1 << 16);
        let mut huge = b"222 body\r\n".to_vec();
        huge.extend(std::iter::repeat_n(b'x', MAX_BUFFER + 10));
        serve(server, "201 hi\r\n", vec![("BODY", huge)]);
        let mut conn = Connection::login(ServerId(0), Box::new(client), &config(None))
            .await
            .unwrap();
        let err = conn.fetch(body("a@b"), &BpsMeter::new(0)).await.unwrap_err();
        assert_eq!(err, NntpError::BufferOverflow { max: MAX_BUFFER });
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let (client, _server) = tokio::io::duplex(1024);
        let mut config = config(None);
        config.timeout = Duration::from_millis(50);
        let err = Connection::login(ServerId(0), Box::new(client), &config)
            .await
            .unwrap_err();
        assert_eq!(err, NntpError::Timeout);
    }

    #[tokio::test]
    async fn trickling_body_times_out_from_the_request() {
        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read).lines();
            write.write_all(b"200 hi\r\n").await.unwrap();
            let _ = lines.next_line().await;
            let _ = write.write_all(b"222 body\r\n").await;
            // one byte at a time, each well within the timeout
            loop {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if write.write_all(b"x").await.is_err() {
                    break;
                }
            }
        });
        let mut config = config(None);
        config.timeout = Duration::from_millis(200);
        let mut conn = Connection::login(ServerId(0), Box::new(client), &config)
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            conn.fetch(body("a@b"), &BpsMeter::new(0)),
        )
        .await
        .expect("fetch gives up on its own")
        .unwrap_err();
        assert_eq!(err, NntpError::Timeout);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn terminator_detection() {
        assert!(is_terminated(b".\r\n"), "empty body");
        assert!(is_terminated(b"abc\r\n.\r\n"));
        assert!(!is_terminated(b"abc\r\n..\r\n"), "stuffed dot line is data");
        assert!(!is_terminated(b"abc\r\n."));
    }
}
