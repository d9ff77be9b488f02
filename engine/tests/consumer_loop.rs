#![cfg(unix)]

mod common;

use aria_engine::commands::downloader::submit_url;
use aria_engine::download::metadata::MetadataResolver;
use aria_engine::history::HistoryStore;
use aria_engine::{
    CollectionChoice, Engine, EngineError, EventConsumer, Job, JobOptions, Notice, PlaylistScope,
    SessionEnd, SessionState, Settings, Submission,
};

use common::{url, FakeTool, WAIT};

/// Feed the consumer until the session is reported finished.
async fn run_session(consumer: &mut EventConsumer) -> Vec<Notice> {
    let mut all = Vec::new();
    loop {
        let batch = tokio::time::timeout(WAIT, consumer.wait())
            .await
            .expect("session did not finish in time")
            .expect("worker gone");
        let done = batch
            .iter()
            .any(|n| matches!(n, Notice::SessionFinished { .. }));
        all.extend(batch);
        if done {
            return all;
        }
    }
}

fn job(id: &str) -> Job {
    Job::new(url(id), &JobOptions::default())
}

#[tokio::test]
async fn failed_job_is_reported_and_later_jobs_land_in_history() {
    let fake = FakeTool::new();
    let (engine, mut consumer) = Engine::start(fake.settings(false));

    engine
        .enqueue(vec![job("fail"), job("b"), job("c")])
        .await
        .unwrap();
    engine.start_session().await.unwrap();
    let notices = run_session(&mut consumer).await;

    let failures: Vec<_> = notices
        .iter()
        .filter_map(|n| match n {
            Notice::DownloadFailed {
                url: u,
                message,
                will_retry,
                ..
            } => Some((u.clone(), message.clone(), *will_retry)),
            _ => None,
        })
        .collect();
    assert_eq!(failures, [(url("fail"), "network timeout".to_string(), false)]);
    assert_eq!(fake.calls(), [url("fail"), url("b"), url("c")]);

    let titles: Vec<_> = consumer
        .history()
        .entries()
        .iter()
        .map(|e| e.title.clone())
        .collect();
    assert_eq!(titles, ["b [x].mp4", "c [x].mp4"]);

    // write-through: the file already holds both entries
    let on_disk = HistoryStore::open(fake.history_path());
    assert_eq!(on_disk.entries(), consumer.history().entries());

    assert_eq!(consumer.failed().len(), 1);
    assert_eq!(consumer.failed()[0].error_message.as_deref(), Some("network timeout"));
    assert_eq!(consumer.board().session(), SessionState::Idle);
    assert_eq!(consumer.board().status_text(), "Download complete!");

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_download_is_retried_once_automatically() {
    let fake = FakeTool::new();
    let (engine, mut consumer) = Engine::start(fake.settings(true));

    engine.enqueue(vec![job("flaky")]).await.unwrap();
    engine.start_session().await.unwrap();
    let notices = run_session(&mut consumer).await;

    assert!(notices.iter().any(|n| matches!(
        n,
        Notice::DownloadFailed { will_retry: true, message, .. }
            if message == "HTTP Error 503: Service Unavailable"
    )));
    assert!(notices.iter().any(|n| matches!(n, Notice::Saved { title, .. } if title == "flaky [x].mp4")));
    assert_eq!(
        notices
            .iter()
            .filter(|n| matches!(n, Notice::SessionFinished { .. }))
            .count(),
        1
    );
    assert_eq!(fake.calls(), [url("flaky"), url("flaky")]);
    assert!(consumer.failed().is_empty());
    assert_eq!(consumer.history().len(), 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn persistent_failure_gives_up_after_one_retry() {
    let fake = FakeTool::new();
    let (engine, mut consumer) = Engine::start(fake.settings(true));

    engine.enqueue(vec![job("fail")]).await.unwrap();
    engine.start_session().await.unwrap();
    let notices = run_session(&mut consumer).await;

    let retries: Vec<bool> = notices
        .iter()
        .filter_map(|n| match n {
            Notice::DownloadFailed { will_retry, .. } => Some(*will_retry),
            _ => None,
        })
        .collect();
    assert_eq!(retries, [true, false]);
    assert_eq!(fake.calls().len(), 2);
    assert_eq!(consumer.failed()[0].attempts, 1);
    assert!(consumer.history().is_empty());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn settings_change_reaches_worker_and_consumer() {
    let fake = FakeTool::new();
    let (engine, mut consumer) = Engine::start(fake.settings(false));
    let mut engine = engine.with_settings_file(fake.dir.path().join("settings.json"));

    let moved = fake.dir.path().join("moved-history.json");
    let next = Settings {
        retry_failed_once: true,
        history_file: Some(moved.to_string_lossy().to_string()),
        ..fake.settings(false)
    };
    engine.update_settings(&mut consumer, next).await.unwrap();
    assert!(consumer.retry_failed_once());
    assert!(fake.dir.path().join("settings.json").exists());

    engine.enqueue(vec![job("flaky")]).await.unwrap();
    engine.start_session().await.unwrap();
    let notices = run_session(&mut consumer).await;

    assert!(notices
        .iter()
        .any(|n| matches!(n, Notice::DownloadFailed { will_retry: true, .. })));
    assert_eq!(fake.calls(), [url("flaky"), url("flaky")]);
    assert_eq!(HistoryStore::open(&moved).len(), 1);
    assert!(!fake.history_path().exists());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancelling_reports_no_error() {
    let fake = FakeTool::new();
    let (engine, mut consumer) = Engine::start(fake.settings(true));

    engine.enqueue(vec![job("slow"), job("b")]).await.unwrap();
    engine.start_session().await.unwrap();

    let mut notices = Vec::new();
    while consumer.board().current_file().is_none() {
        let batch = tokio::time::timeout(WAIT, consumer.wait()).await.unwrap().unwrap();
        notices.extend(batch);
    }
    assert_eq!(consumer.board().status_text(), "Downloading slow.webm");
    engine.cancel();
    notices.extend(run_session(&mut consumer).await);

    assert!(notices.contains(&Notice::Cancelled {
        title: "Title slow".into()
    }));
    assert!(!notices.iter().any(|n| matches!(n, Notice::DownloadFailed { .. })));
    assert!(notices.contains(&Notice::SessionFinished {
        end: SessionEnd::Cancelled,
        remaining: 1
    }));
    assert_eq!(consumer.board().status_text(), "Download cancelled");
    assert_eq!(consumer.board().session(), SessionState::Cancelled);
    assert_eq!(engine.queued().await.unwrap().len(), 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn whole_playlist_run_records_every_merged_file() {
    let fake = FakeTool::new();
    let (engine, mut consumer) = Engine::start(fake.settings(false));

    let submission = engine
        .submit(&format!("{}&list=PL", url("m1")), &JobOptions::default())
        .await
        .unwrap();
    let Submission::Collection(prompt) = submission else {
        panic!("expected a playlist prompt");
    };
    assert_eq!(prompt.members().len(), 3);
    let added = engine
        .enqueue_collection(prompt, CollectionChoice::EntireCollection)
        .await
        .unwrap();
    assert_eq!(added, 1);
    let queued = engine.queued().await.unwrap();
    assert_eq!(queued[0].playlist_scope, PlaylistScope::EntireCollection);

    engine.start_session().await.unwrap();
    run_session(&mut consumer).await;

    let titles: Vec<_> = consumer
        .history()
        .entries()
        .iter()
        .map(|e| e.title.clone())
        .collect();
    assert_eq!(titles, ["01 - Track [1].mp4", "02 - Track [2].mp4"]);
    assert_eq!(consumer.board().stage(), Some((2, 2)));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn expanded_playlist_becomes_member_jobs() {
    let fake = FakeTool::new();
    let (engine, mut consumer) = Engine::start(fake.settings(false));

    let Submission::Collection(prompt) = engine
        .submit("https://e.com/playlist?list=PL", &JobOptions::default())
        .await
        .unwrap()
    else {
        panic!("expected a playlist prompt");
    };
    let added = engine
        .enqueue_collection(prompt, CollectionChoice::ExpandMembers)
        .await
        .unwrap();
    assert_eq!(added, 3);
    assert!(engine
        .queued()
        .await
        .unwrap()
        .iter()
        .all(|j| j.originates_from_collection));
    engine.start_session().await.unwrap();
    run_session(&mut consumer).await;

    assert_eq!(fake.calls(), [url("m1"), url("m2"), url("m3")]);
    assert_eq!(consumer.history().len(), 3);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn single_member_playlist_needs_no_prompt() {
    let fake = FakeTool::new();
    let resolver = MetadataResolver::new(fake.tool());

    let sub = submit_url(
        &resolver,
        "https://e.com/watch?v=solo&list=ONE",
        &JobOptions::default(),
    )
    .await
    .unwrap();
    let Submission::Ready(jobs) = sub else {
        panic!("single-entry playlist should not prompt");
    };
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].source_url, "https://e.com/watch?v=solo");
    assert!(jobs[0].originates_from_collection);
    assert_eq!(jobs[0].title.as_deref(), Some("Solo"));
}

#[tokio::test]
async fn unlistable_playlist_is_an_error() {
    let fake = FakeTool::new();
    let resolver = MetadataResolver::new(fake.tool());

    let err = submit_url(
        &resolver,
        "https://e.com/playlist?list=EMPTY",
        &JobOptions::default(),
    )
    .await
    .unwrap_err();
    match err {
        EngineError::MetadataFetch { message, .. } => {
            assert_eq!(message, "The playlist does not exist")
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn history_survives_restart_and_redownload_queues_entry() {
    let fake = FakeTool::new();
    {
        let (engine, mut consumer) = Engine::start(fake.settings(false));
        engine.enqueue(vec![job("a"), job("b")]).await.unwrap();
        engine.start_session().await.unwrap();
        run_session(&mut consumer).await;
        engine.shutdown().await.unwrap();
    }

    let (engine, mut consumer) = Engine::start(fake.settings(false));
    let newest: Vec<_> = consumer
        .history()
        .newest_first()
        .map(|e| e.source_url.clone())
        .collect();
    assert_eq!(newest, [url("b"), url("a")]);

    let entry = consumer.history().entries()[0].clone();
    consumer.redownload(&entry, &JobOptions::default()).unwrap();
    engine.start_session().await.unwrap();
    run_session(&mut consumer).await;
    assert_eq!(consumer.history().len(), 3);
    assert_eq!(consumer.history().entries()[2].source_url, url("a"));

    consumer.clear_history().unwrap();
    assert!(HistoryStore::open(fake.history_path()).is_empty());

    engine.shutdown().await.unwrap();
}
