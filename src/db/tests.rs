use super::*;
use chrono::{TimeZone, Utc};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

fn entry(name: &str, status: Status, completed_at: i64) -> HistoryEntry {
    HistoryEntry {
        id: 0,
        job_id: JobId(0xabc),
        name: name.to_string(),
        category: Some("tv".to_string()),
        destination: Some(PathBuf::from("/complete/tv").join(name)),
        status,
        fail_message: (status == Status::Failed).then(|| "par2 repair failed".to_string()),
        size_bytes: 5 * 1024 * 1024,
        download_time: Duration::from_secs(90),
        completed_at: Utc.timestamp_opt(completed_at, 0).unwrap(),
    }
}

async fn open(dir: &TempDir) -> Database {
    Database::new(&dir.path().join("history.db")).await.unwrap()
}

#[tokio::test]
async fn insert_and_read_back_a_record() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir).await;

    let id = db
        .insert_history(&entry("Show.S01E01", Status::Failed, 1_700_000_000))
        .await
        .unwrap();
    assert!(id > 0);

    let stored = db.get_history_entry(id).await.unwrap().expect("record exists");
    assert_eq!(stored.id, id);
    assert_eq!(stored.job_id, JobId(0xabc), "job id survives as hex text");
    assert_eq!(stored.name, "Show.S01E01");
    assert_eq!(stored.status, Status::Failed);
    assert_eq!(stored.fail_message.as_deref(), Some("par2 repair failed"));
    assert_eq!(stored.download_time, Duration::from_secs(90));
    assert_eq!(stored.completed_at.timestamp(), 1_700_000_000);

    db.close().await;
}

#[tokio::test]
async fn query_returns_newest_first_with_paging_and_filter() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir).await;
    for i in 0..5 {
        let status = if i == 2 { Status::Failed } else { Status::Completed };
        db.insert_history(&entry(&format!("Job.{i}"), status, 1_700_000_000 + i))
            .await
            .unwrap();
    }

    let page = db.query_history(None, 3, 0).await.unwrap();
    let names: Vec<_> = page.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["Job.4", "Job.3", "Job.2"], "most recent first");
    assert_eq!(db.query_history(None, 3, 3).await.unwrap().len(), 2);

    let failed = db
        .query_history(Some(Status::Failed.to_i32()), 10, 0)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].name, "Job.2");
    assert_eq!(db.count_history(None).await.unwrap(), 5);
    assert_eq!(
        db.delete_history_before(1_700_000_002).await.unwrap(),
        2,
        "two records are older than the cut-off"
    );

    db.close().await;
}

#[tokio::test]
async fn reopening_keeps_records_and_schema() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir).await;
    db.insert_history(&entry("Kept", Status::Completed, 1_700_000_000))
        .await
        .unwrap();
    db.close().await;

    let db = open(&dir).await;
    let recent = db.recent(10).await.unwrap();
    assert_eq!(recent.len(), 1, "migrations do not run twice");
    db.close().await;
}

#[tokio::test]
async fn memory_history_assigns_ids_and_limits() {
    let history = MemoryHistory::new();
    for i in 0..3 {
        let id = history
            .record(&entry(&format!("M{i}"), Status::Completed, i))
            .await
            .unwrap();
        assert_eq!(id, i + 1);
    }
    let recent = history.recent(2).await.unwrap();
    assert_eq!(
        recent.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
        vec!["M2", "M1"]
    );
}
