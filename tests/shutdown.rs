//! Stopping the engine in the middle of a download

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::time::{Duration, Instant};

use common::*;
use serial_test::serial;
use tempfile::TempDir;
use usenet_engine::persistence::{QUEUE_FILE, load_queue};
use usenet_engine::{Engine, Error, Event, JobOptions, Status};

#[tokio::test]
#[serial]
async fn shutdown_saves_the_queue_and_restart_restores_it() {
    let dir = TempDir::new().unwrap();
    let movie = Posted::new("movie.mkv", payload(90_000, 9), 30_000);
    let stub = NntpStub::start(
        Script::new()
            .articles(movie.articles.clone())
            .hang_on_fetch(),
    )
    .await;
    let config = config(dir.path(), vec![stub_server("main", stub.port(), 0)]);

    let engine = Engine::new(config.clone()).await.unwrap();
    engine.start().unwrap();
    let mut events = engine.subscribe();
    let id = engine
        .add_nzb_content(nzb(&[&movie]).as_bytes(), "movie.nzb", JobOptions::default())
        .await
        .unwrap();

    // wait until a connection sits on an unanswered request
    let asked = tokio::time::timeout(EVENT_TIMEOUT, async {
        while !stub.commands().iter().any(|c| c.starts_with("BODY")) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(asked.is_ok(), "no article was requested: {:?}", stub.commands());

    let started = Instant::now();
    engine.shutdown().await.unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(15),
        "a hanging server does not hold up shutdown ({:?})",
        started.elapsed()
    );

    let mut seen = Vec::new();
    wait_for(&mut events, &mut seen, |e| matches!(e, Event::Shutdown)).await;
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, Event::Complete { .. } | Event::Failed { .. })),
        "the job neither completed nor failed: {seen:#?}"
    );

    assert!(dir.path().join("admin").join(QUEUE_FILE).is_file());
    let saved = load_queue(&dir.path().join("admin"))
        .await
        .unwrap()
        .expect("queue file");
    assert_eq!(saved.jobs.len(), 1);
    assert_eq!(saved.jobs[0].id, id);
    assert!(
        std::fs::read_dir(dir.path().join("complete"))
            .unwrap()
            .next()
            .is_none(),
        "nothing reached the complete folder"
    );

    assert!(
        matches!(
            engine
                .add_nzb_content(nzb(&[&movie]).as_bytes(), "late.nzb", JobOptions::default())
                .await,
            Err(Error::ShuttingDown)
        ),
        "new jobs are refused after shutdown"
    );
    drop(engine);

    let restarted = Engine::new(config).await.unwrap();
    let stats = restarted.queue_stats().await;
    assert_eq!(stats.jobs.len(), 1, "the job is back in the queue");
    assert_eq!(stats.jobs[0].id, id);
    assert_eq!(stats.jobs[0].name, "movie");
    assert_eq!(stats.jobs[0].status, Status::Queued);
}
