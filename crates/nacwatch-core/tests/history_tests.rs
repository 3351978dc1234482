use chrono::{Duration, Utc};
use nacwatch_core::history::{HistoryStore, HistoryTable};
use nacwatch_core::model::{HealthSample, ReportRun, ReportStats, SampleStatus};
use tempfile::tempdir;
use uuid::Uuid;

fn run_with(total: u64) -> ReportRun {
    ReportRun::succeeded(
        Uuid::new_v4(),
        Utc::now(),
        3.0,
        ReportStats {
            total_devices: total,
            ..ReportStats::default()
        },
        Vec::new(),
    )
}

#[tokio::test]
async fn overlapping_writers_on_one_file_both_persist() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("history.db");
    let first = HistoryStore::open(&db).await.unwrap();
    let second = HistoryStore::open(&db).await.unwrap();

    let a = run_with(10);
    let b = run_with(20);
    let (ra, rb) = tokio::join!(first.record_run(&a), second.record_run(&b));
    ra.unwrap();
    rb.unwrap();

    let runs = first.recent_runs(10).await.unwrap();
    assert_eq!(runs.len(), 2);
    let ids: Vec<Uuid> = runs.iter().map(|r| r.run_id).collect();
    assert!(ids.contains(&a.run_id));
    assert!(ids.contains(&b.run_id));
    assert_eq!(first.count(HistoryTable::HealthSamples).await.unwrap(), 2);

    first.close().await;
    second.close().await;
}

#[tokio::test]
async fn purge_removes_only_rows_past_cutoff() {
    let store = HistoryStore::in_memory().await.unwrap();
    for days in [10, 40, 60] {
        store
            .record_health_sample(&HealthSample {
                run_id: None,
                timestamp: Utc::now() - Duration::days(days),
                status: SampleStatus::Success,
                duration_seconds: 1.0,
            })
            .await
            .unwrap();
    }

    let report = store
        .purge_older_than(HistoryTable::HealthSamples, 30)
        .await
        .unwrap();
    assert_eq!(report.removed, 2);
    assert!(report.oldest.unwrap() < report.newest.unwrap());
    assert_eq!(store.count(HistoryTable::HealthSamples).await.unwrap(), 1);

    let left = store
        .samples_since(Utc::now() - Duration::days(365))
        .await
        .unwrap();
    assert_eq!(left.len(), 1);
    assert!(left[0].timestamp > Utc::now() - Duration::days(11));
}

#[tokio::test]
async fn reopening_keeps_prior_runs() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("nested/history.db");
    let run = run_with(42);
    {
        let store = HistoryStore::open(&db).await.unwrap();
        store.record_run(&run).await.unwrap();
        store.close().await;
    }
    let store = HistoryStore::open(&db).await.unwrap();
    let latest = store.recent_successful_runs(1).await.unwrap();
    assert_eq!(latest[0].run_id, run.run_id);
    assert_eq!(latest[0].stats.total_devices, 42);
}
