//! A scripted NNTP server on a local port
//!
//! Serves pre-encoded article bodies by message-id and answers `430` for
//! anything else. Every command line received is logged so tests can check
//! which server was asked for what.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// What the stub serves and how it behaves
#[derive(Default, Clone)]
pub struct Script {
    articles: HashMap<String, Vec<u8>>,
    missing: HashSet<String>,
    password: Option<String>,
    hang_on_fetch: bool,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` (a yEnc block without the terminating dot line) for `message_id`
    pub fn article(mut self, message_id: &str, body: Vec<u8>) -> Self {
        self.articles.insert(message_id.to_string(), body);
        self
    }

    /// Serve every `(message_id, body)` pair
    pub fn articles(mut self, articles: impl IntoIterator<Item = (String, Vec<u8>)>) -> Self {
        self.articles.extend(articles);
        self
    }

    /// Answer `430` for `message_id` even when it has a body
    pub fn missing(mut self, message_id: &str) -> Self {
        self.missing.insert(message_id.to_string());
        self
    }

    /// Only accept `AUTHINFO PASS password`
    pub fn password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    /// Never answer article requests
    pub fn hang_on_fetch(mut self) -> Self {
        self.hang_on_fetch = true;
        self
    }
}

/// A running stub; the accept loop stops when it is dropped
pub struct NntpStub {
    pub addr: SocketAddr,
    log: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl NntpStub {
    pub async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let script = Arc::new(script);

        let accept_log = Arc::clone(&log);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let script = Arc::clone(&script);
                let log = Arc::clone(&accept_log);
                tokio::spawn(async move {
                    let _ = serve(stream, &script, &log).await;
                });
            }
        });

        Self { addr, log, task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Every command line received so far
    pub fn commands(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether any article command named `message_id`
    pub fn was_asked_for(&self, message_id: &str) -> bool {
        let needle = format!("<{message_id}>");
        self.commands().iter().any(|c| c.ends_with(&needle))
    }
}

impl Drop for NntpStub {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    stream: TcpStream,
    script: &Script,
    log: &Mutex<Vec<String>>,
) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    write.write_all(b"200 stub ready\r\n").await?;

    while let Some(line) = lines.next_line().await? {
        log.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.clone());
        let (verb, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        let verb = verb.to_ascii_uppercase();

        let reply = match verb.as_str() {
            "AUTHINFO" => match arg.split_once(' ') {
                Some(("USER", _)) => b"381 password required\r\n".to_vec(),
                Some(("PASS", given))
                    if script.password.as_deref().is_none_or(|p| p == given) =>
                {
                    b"281 welcome\r\n".to_vec()
                }
                _ => b"481 authentication failed\r\n".to_vec(),
            },
            "GROUP" => format!("211 0 0 0 {arg}\r\n").into_bytes(),
            "BODY" | "ARTICLE" | "HEAD" | "STAT" => {
                if script.hang_on_fetch {
                    std::future::pending::<()>().await;
                }
                let id = arg.trim().trim_start_matches('<').trim_end_matches('>');
                match script.articles.get(id) {
                    Some(body) if !script.missing.contains(id) => article_reply(&verb, id, body),
                    _ => b"430 no such article\r\n".to_vec(),
                }
            }
            "QUIT" => {
                write.write_all(b"205 bye\r\n").await?;
                return Ok(());
            }
            _ => b"500 unknown command\r\n".to_vec(),
        };
        write.write_all(&reply).await?;
        write.flush().await?;
    }
    Ok(())
}

fn article_reply(verb: &str, id: &str, body: &[u8]) -> Vec<u8> {
    let headers = format!("Message-ID: <{id}>\r\nSubject: stub\r\n");
    let mut out = Vec::with_capacity(body.len() + 128);
    match verb {
        "BODY" => {
            out.extend_from_slice(format!("222 0 <{id}> body\r\n").as_bytes());
            out.extend_from_slice(body);
        }
        "ARTICLE" => {
            out.extend_from_slice(format!("220 0 <{id}> article\r\n{headers}\r\n").as_bytes());
            out.extend_from_slice(body);
        }
        "HEAD" => out.extend_from_slice(format!("221 0 <{id}> head\r\n{headers}").as_bytes()),
        _ => return format!("223 0 <{id}> exists\r\n").into_bytes(),
    }
    out.extend_from_slice(b".\r\n");
    out
}
