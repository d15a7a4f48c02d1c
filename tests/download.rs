//! End-to-end downloads against stub NNTP servers
//!
//! No external tools are used: the parity handler is the no-op one, so
//! post-processing only verifies what it can in-process and moves the files.

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::time::Duration;

use common::*;
use serial_test::serial;
use tempfile::TempDir;
use usenet_engine::{Engine, Event, JobOptions, PostProcess, Status};

async fn started(config: usenet_engine::Config) -> Engine {
    let engine = Engine::new(config).await.unwrap();
    engine.start().unwrap();
    engine
}

#[tokio::test]
#[serial]
async fn clean_download_lands_in_the_complete_folder() {
    let dir = TempDir::new().unwrap();
    let alpha = Posted::new("alpha.bin", payload(200_000, 1), 100_000);
    let beta = Posted::new("beta.bin", payload(50_000, 2), 100_000);
    let stub = NntpStub::start(
        Script::new()
            .articles(alpha.articles.clone())
            .articles(beta.articles.clone()),
    )
    .await;

    let engine = started(config(dir.path(), vec![stub_server("main", stub.port(), 0)])).await;
    let mut events = engine.subscribe();
    let id = engine
        .add_nzb_content(nzb(&[&alpha, &beta]).as_bytes(), "clean.nzb", JobOptions::default())
        .await
        .unwrap();

    let mut seen = Vec::new();
    let outcome = wait_for_outcome(&mut events, &mut seen).await;
    let destination = dir.path().join("complete/clean");
    match outcome {
        Event::Complete { id: done, path } => {
            assert_eq!(done, id);
            assert_eq!(path, destination);
        }
        other => panic!("expected completion, got {other:?}; seen: {seen:#?}"),
    }

    assert_eq!(
        std::fs::read(destination.join("alpha.bin")).unwrap(),
        alpha.data,
        "two segments are joined in order"
    );
    assert_eq!(std::fs::read(destination.join("beta.bin")).unwrap(), beta.data);
    assert!(
        !dir.path().join("incomplete/clean").exists(),
        "job directory is removed after the move"
    );

    let history = engine.history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, Status::Completed);
    assert!(engine.queue_stats().await.jobs.is_empty());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn missing_articles_are_fetched_from_the_backup_server() {
    let dir = TempDir::new().unwrap();
    let alpha = Posted::new("alpha.bin", payload(60_000, 3), 30_000);
    let beta = Posted::new("beta.bin", payload(10_000, 4), 30_000);

    let mut primary_script = Script::new()
        .articles(alpha.articles.clone())
        .articles(beta.articles.clone());
    for id in alpha.message_ids() {
        primary_script = primary_script.missing(&id);
    }
    let primary = NntpStub::start(primary_script).await;
    let backup = NntpStub::start(
        Script::new()
            .articles(alpha.articles.clone())
            .articles(beta.articles.clone()),
    )
    .await;

    let engine = started(config(
        dir.path(),
        vec![
            stub_server("primary", primary.port(), 0),
            stub_server("backup", backup.port(), 1),
        ],
    ))
    .await;
    let mut events = engine.subscribe();
    engine
        .add_nzb_content(nzb(&[&alpha, &beta]).as_bytes(), "fallback.nzb", JobOptions::default())
        .await
        .unwrap();

    let mut seen = Vec::new();
    let outcome = wait_for_outcome(&mut events, &mut seen).await;
    assert!(
        matches!(outcome, Event::Complete { .. }),
        "expected completion: {seen:#?}"
    );

    for id in alpha.message_ids() {
        assert!(primary.was_asked_for(&id), "primary is asked first for {id}");
        assert!(backup.was_asked_for(&id), "backup supplies {id}");
    }
    for id in beta.message_ids() {
        assert!(
            !backup.was_asked_for(&id),
            "backup is not bothered with {id}, which the primary had"
        );
    }
    assert_eq!(
        std::fs::read(dir.path().join("complete/fallback/alpha.bin")).unwrap(),
        alpha.data
    );

    engine.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn rejected_login_blocks_the_server_for_a_while() {
    let dir = TempDir::new().unwrap();
    let alpha = Posted::new("alpha.bin", payload(40_000, 5), 20_000);
    let strict = NntpStub::start(
        Script::new()
            .articles(alpha.articles.clone())
            .password("right"),
    )
    .await;
    let backup = NntpStub::start(Script::new().articles(alpha.articles.clone())).await;

    let mut bad = stub_server("strict", strict.port(), 0);
    bad.username = Some("user".into());
    bad.password = Some("wrong".into());
    let engine = started(config(
        dir.path(),
        vec![bad, stub_server("backup", backup.port(), 1)],
    ))
    .await;
    let mut events = engine.subscribe();
    engine
        .add_nzb_content(nzb(&[&alpha]).as_bytes(), "login.nzb", JobOptions::default())
        .await
        .unwrap();

    let mut seen = Vec::new();
    let disabled = wait_for(&mut events, &mut seen, |e| {
        matches!(e, Event::ServerDisabled { server, .. } if server == "strict")
    })
    .await;
    let Event::ServerDisabled { penalty, .. } = disabled else {
        unreachable!()
    };
    assert_eq!(
        penalty,
        Duration::from_secs(600),
        "a bad login is a timed block"
    );
    assert!(
        engine
            .scheduled()
            .iter()
            .any(|t| t.name == "reactivate strict"),
        "reactivation is scheduled: {:?}",
        engine.scheduled()
    );

    let outcome = wait_for_outcome(&mut events, &mut seen).await;
    assert!(
        matches!(outcome, Event::Complete { .. }),
        "the backup completes the job: {seen:#?}"
    );
    assert!(
        strict
            .commands()
            .iter()
            .all(|c| c.starts_with("AUTHINFO") || c == "QUIT"),
        "nothing was requested from the blocked server: {:?}",
        strict.commands()
    );

    engine.unblock_server("strict").unwrap();
    wait_for(&mut events, &mut seen, |e| {
        matches!(e, Event::ServerReactivated { server } if server == "strict")
    })
    .await;

    engine.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn missing_data_promotes_par2_volumes() {
    let dir = TempDir::new().unwrap();
    let data: Vec<Posted> = (1..=10)
        .map(|i| Posted::new(&format!("foo-{i:02}.bin"), payload(1_000, i), 1_000))
        .collect();
    let index = Posted::new("foo.par2", payload(500, 20), 1_000);
    let volumes: Vec<Posted> = [
        ("foo.vol000+01.par2", 1_000),
        ("foo.vol001+02.par2", 2_000),
        ("foo.vol003+04.par2", 4_000),
        ("foo.vol007+08.par2", 8_000),
    ]
    .into_iter()
    .enumerate()
    .map(|(i, (name, size))| Posted::new(name, payload(size, 30 + i as u8), 10_000))
    .collect();

    let lost = [&data[2], &data[6]];
    let mut script = Script::new().articles(index.articles.clone());
    for file in data.iter().chain(&volumes) {
        script = script.articles(file.articles.clone());
    }
    for file in lost {
        script = script.missing(&file.message_ids()[0]);
    }
    let stub = NntpStub::start(script).await;

    let engine = started(config(dir.path(), vec![stub_server("main", stub.port(), 0)])).await;
    let mut events = engine.subscribe();
    let mut files: Vec<&Posted> = data.iter().collect();
    files.push(&index);
    files.extend(volumes.iter());
    engine
        .add_nzb_content(nzb(&files).as_bytes(), "foo.nzb", JobOptions::default())
        .await
        .unwrap();

    let mut seen = Vec::new();
    wait_for_outcome(&mut events, &mut seen).await;

    let promoted: u32 = seen
        .iter()
        .filter_map(|e| match e {
            Event::Par2Promoted { setname, blocks, .. } if setname == "foo" => Some(*blocks),
            _ => None,
        })
        .sum();
    assert!(
        promoted >= lost.len() as u32,
        "at least one block per lost article is promoted: {seen:#?}"
    );
    assert!(
        stub.was_asked_for(&volumes[0].message_ids()[0]),
        "the smallest volume is downloaded"
    );
    assert!(
        !stub.was_asked_for(&volumes[3].message_ids()[0]),
        "the largest volume stays held back"
    );

    engine.shutdown().await.unwrap();
}

#[tokio::test]
#[serial]
async fn obfuscated_file_is_renamed_from_par2_metadata() {
    let dir = TempDir::new().unwrap();
    let hex = "a3f8b2c9d1e5f7a4b6c8d0e2f4a6b8c0";
    let movie = Posted::new(hex, payload(20 * 1024, 7), 64 * 1024);
    let par2_name = format!("{hex}.par2");
    let index = Posted::new(&par2_name, par2_file_desc("Movie.mkv", &movie.data), 64 * 1024);
    let stub = NntpStub::start(
        Script::new()
            .articles(movie.articles.clone())
            .articles(index.articles.clone()),
    )
    .await;

    let engine = started(config(dir.path(), vec![stub_server("main", stub.port(), 0)])).await;
    let mut events = engine.subscribe();
    let options = JobOptions {
        post_process: Some(PostProcess::None),
        ..Default::default()
    };
    engine
        .add_nzb_content(nzb(&[&movie, &index]).as_bytes(), "release.nzb", options)
        .await
        .unwrap();

    let mut seen = Vec::new();
    let outcome = wait_for_outcome(&mut events, &mut seen).await;
    assert!(
        matches!(outcome, Event::Complete { .. }),
        "expected completion: {seen:#?}"
    );
    assert!(
        seen.iter().any(|e| matches!(
            e,
            Event::FileRenamed { old_name, new_name, .. } if old_name == hex && new_name == "Movie.mkv"
        )),
        "rename is reported: {seen:#?}"
    );

    let destination = dir.path().join("complete/release");
    assert_eq!(
        std::fs::read(destination.join("Movie.mkv")).unwrap(),
        movie.data
    );
    assert!(!destination.join(hex).exists(), "obfuscated name is gone");

    engine.shutdown().await.unwrap();
}
