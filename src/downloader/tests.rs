use super::*;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::broadcast;

use crate::engine::{Receivers, test_context};
use crate::error::NntpError;
use crate::job::ArticleOutcome;
use crate::job::test_helpers::{job, test_config};
use crate::nntp::FetchReply;
use crate::types::Event;

const S0: ServerId = ServerId(0);
const S1: ServerId = ServerId(1);

/// A downloader over `priorities` servers with one three-segment job queued
async fn setup(dir: &TempDir, priorities: &[u32]) -> (Downloader, Receivers) {
    let (ctx, mut rx) = test_context(test_config(dir.path(), priorities));
    let job = job(&ctx.config, &[("movie.mkv", 3, 1000)]);
    ctx.queue.lock().await.add(job);
    let commands = std::mem::replace(&mut rx.downloader, mpsc::unbounded_channel().1);
    (Downloader::new(ctx, commands), rx)
}

/// Prefetch for `server` and put the first article in slot 0
async fn claim(dl: &mut Downloader, server: ServerId, command: NntpCommand) -> Option<ArticleRef> {
    let ctx = Arc::clone(&dl.ctx);
    let mut queue = ctx.queue.lock().await;
    let state = dl.state_mut(server)?;
    let article = state
        .server
        .next_article(&mut queue, Instant::now(), false)
        .article?;
    state.slots[0].busy = Some((article, command));
    Some(article)
}

fn fetched(server: ServerId, article: ArticleRef, reply: FetchReply) -> WorkerEvent {
    WorkerEvent::Fetched {
        server,
        slot: 0,
        article,
        reply,
    }
}

fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[test]
fn servers_without_connections_take_no_part() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), &[0, 1]);
    config.servers[1].connections = 0;

    let views = server_views(&config);
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].id, S0);
}

#[tokio::test]
async fn servers_are_walked_best_priority_first() {
    let dir = TempDir::new().unwrap();
    let (dl, _rx) = setup(&dir, &[5, 0]).await;

    let order: Vec<ServerId> = dl.servers.iter().map(|s| s.server.id).collect();
    assert_eq!(order, vec![S1, S0]);
}

#[tokio::test]
async fn lower_priority_server_waits_for_the_better_one() {
    let dir = TempDir::new().unwrap();
    let (mut dl, _rx) = setup(&dir, &[0, 1]).await;

    assert!(
        claim(&mut dl, S1, NntpCommand::Body).await.is_none(),
        "articles are reserved for the priority 0 server"
    );
    assert!(claim(&mut dl, S0, NntpCommand::Body).await.is_some());
}

#[tokio::test]
async fn missing_article_fails_over_to_the_next_server() {
    let dir = TempDir::new().unwrap();
    let (mut dl, mut rx) = setup(&dir, &[0, 1]).await;
    let article = claim(&mut dl, S0, NntpCommand::Body).await.unwrap();

    dl.handle_event(fetched(S0, article, FetchReply::Missing)).await;

    {
        let queue = dl.ctx.queue.lock().await;
        let art = queue.article(article).unwrap();
        assert_eq!(art.fetcher(), None, "article released");
        assert!(art.try_list().contains(S0), "server 0 is not asked again");
    }
    assert!(rx.decoder.try_recv().is_err(), "nothing reported missing yet");
    assert!(dl.servers[0].slots[0].busy.is_none(), "slot is free again");

    assert_eq!(
        claim(&mut dl, S1, NntpCommand::Body).await,
        Some(article),
        "the backup server picks the article up"
    );
}

#[tokio::test]
async fn missing_everywhere_goes_to_the_decoder() {
    let dir = TempDir::new().unwrap();
    let (mut dl, mut rx) = setup(&dir, &[0]).await;
    let article = claim(&mut dl, S0, NntpCommand::Body).await.unwrap();

    dl.handle_event(fetched(S0, article, FetchReply::Missing)).await;

    let request = rx.decoder.try_recv().expect("a decode request");
    assert_eq!(request.article, article);
    assert_eq!(request.outcome, ArticleOutcome::Missing);
}

#[tokio::test]
async fn body_is_forwarded_to_the_decoder() {
    let dir = TempDir::new().unwrap();
    let (mut dl, mut rx) = setup(&dir, &[0]).await;
    let article = claim(&mut dl, S0, NntpCommand::Body).await.unwrap();

    dl.handle_event(fetched(S0, article, FetchReply::Body(b"=ybegin\r\n".to_vec())))
        .await;

    let request = rx.decoder.try_recv().expect("a decode request");
    assert_eq!(request.server, S0);
    assert!(matches!(request.outcome, ArticleOutcome::Fetched(_)));
}

#[tokio::test]
async fn unsupported_body_switches_to_article() {
    let dir = TempDir::new().unwrap();
    let (mut dl, mut rx) = setup(&dir, &[0]).await;
    let article = claim(&mut dl, S0, NntpCommand::Body).await.unwrap();
    let prefetched = dl.servers[0].server.queued_articles();

    dl.handle_event(fetched(S0, article, FetchReply::NoCommand)).await;

    let state = &dl.servers[0];
    assert!(!state.server.have_body);
    assert_eq!(
        state.server.queued_articles(),
        prefetched + 1,
        "article goes back to the head of the prefetch queue"
    );
    assert!(rx.decoder.try_recv().is_err());

    let queue = dl.ctx.queue.lock().await;
    let request = super::dispatch::build_request(&state.server, &queue, article).unwrap();
    assert_eq!(request.command, NntpCommand::Article);
}

#[tokio::test]
async fn bad_login_blocks_the_server_and_schedules_reactivation() {
    let dir = TempDir::new().unwrap();
    let (mut dl, _rx) = setup(&dir, &[0, 1]).await;
    let mut events = dl.ctx.events.subscribe();
    let article = claim(&mut dl, S0, NntpCommand::Body).await.unwrap();

    dl.handle_event(WorkerEvent::Failed {
        server: S0,
        slot: 0,
        article: Some(article),
        error: NntpError::Auth {
            code: 481,
            message: "Authentication failed".into(),
        },
    })
    .await;

    assert!(!dl.servers[0].server.active);
    assert_eq!(dl.servers[0].server.queued_articles(), 0, "prefetch handed back");
    {
        let queue = dl.ctx.queue.lock().await;
        assert!(!queue.servers().iter().find(|s| s.id == S0).unwrap().active);
        assert_eq!(queue.article(article).unwrap().fetcher(), None);
    }
    assert!(
        dl.ctx
            .scheduler
            .pending()
            .iter()
            .any(|t| t.name == "reactivate server0"),
        "reactivation is scheduled"
    );
    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        Event::ServerDisabled { server, .. } if server == "server0"
    )));

    assert_eq!(
        claim(&mut dl, S1, NntpCommand::Body).await,
        Some(article),
        "the backup server takes over"
    );
}

#[tokio::test]
async fn only_the_current_block_is_lifted() {
    let dir = TempDir::new().unwrap();
    let (mut dl, _rx) = setup(&dir, &[0]).await;
    dl.handle_event(WorkerEvent::Failed {
        server: S0,
        slot: 0,
        article: None,
        error: NntpError::Auth {
            code: 481,
            message: "Authentication failed".into(),
        },
    })
    .await;
    let stamp = dl.servers[0].server.penalty().unwrap().stamp;

    dl.handle_command(Command::ReactivateServer {
        server: S0,
        stamp: stamp + 1,
    })
    .await;
    assert!(!dl.servers[0].server.active, "stale stamp is ignored");

    dl.handle_command(Command::ReactivateServer { server: S0, stamp })
        .await;
    assert!(dl.servers[0].server.active);
    let queue = dl.ctx.queue.lock().await;
    assert!(queue.servers()[0].active, "queue sees the server again");
}

#[tokio::test]
async fn timeout_only_delays_the_connection() {
    let dir = TempDir::new().unwrap();
    let (mut dl, _rx) = setup(&dir, &[0]).await;
    let article = claim(&mut dl, S0, NntpCommand::Body).await.unwrap();

    dl.handle_event(WorkerEvent::Failed {
        server: S0,
        slot: 0,
        article: Some(article),
        error: NntpError::Timeout,
    })
    .await;

    let state = &dl.servers[0];
    assert!(state.server.active, "transient errors do not block");
    assert!(state.slots[0].reconnect_at.is_some());
    let queue = dl.ctx.queue.lock().await;
    assert_eq!(queue.article(article).unwrap().fetcher(), None);
}

#[tokio::test]
async fn pause_and_resume_are_reported_once() {
    let dir = TempDir::new().unwrap();
    let (mut dl, _rx) = setup(&dir, &[0]).await;
    let mut events = dl.ctx.events.subscribe();

    dl.handle_command(Command::Pause).await;
    dl.handle_command(Command::Pause).await;
    assert!(dl.ctx.paused.load(Ordering::SeqCst));

    dl.handle_command(Command::Resume).await;
    assert!(!dl.ctx.paused.load(Ordering::SeqCst));
    tokio::time::timeout(
        std::time::Duration::from_millis(100),
        dl.ctx.assembly_retry.notified(),
    )
    .await
    .expect("resume asks the assembler to retry stalled files");

    let events = drain(&mut events);
    let paused = events
        .iter()
        .filter(|e| matches!(e, Event::QueuePaused))
        .count();
    assert_eq!(paused, 1, "second pause is a no-op: {events:?}");
    assert!(events.iter().any(|e| matches!(e, Event::QueueResumed)));
}

#[tokio::test]
async fn forgotten_job_leaves_the_prefetch_queue() {
    let dir = TempDir::new().unwrap();
    let (mut dl, _rx) = setup(&dir, &[0]).await;
    let article = claim(&mut dl, S0, NntpCommand::Body).await.unwrap();
    assert!(dl.servers[0].server.queued_articles() > 0);

    dl.handle_command(Command::ForgetJob(article.job)).await;

    assert_eq!(dl.servers[0].server.queued_articles(), 0);
}
