mod common;

use chunkloader::backend::{BackendActor, BackendCommand, BackendEvent};
use chunkloader::downloader::{DownloadEngine, FileTarget};
use common::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

const URL: &str = "http://origin.test/weights.bin";

fn spawn_actor(
    temp: &TempDir,
    fetcher: Arc<MockFetcher>,
) -> (
    mpsc::Sender<BackendCommand>,
    mpsc::Receiver<BackendEvent>,
    tokio::task::JoinHandle<()>,
) {
    let sizes = StaticSizes(HashMap::from([(URL.to_string(), 4000)]));
    let engine = DownloadEngine::with_backends(
        fast_config(flat_tiers(1000)),
        store_in(temp.path()),
        backends(fetcher, sizes),
    );
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let (event_tx, event_rx) = mpsc::channel(256);
    let handle = tokio::spawn(BackendActor::new(engine, cmd_rx, event_tx).run());
    (cmd_tx, event_rx, handle)
}

async fn next_terminal(events: &mut mpsc::Receiver<BackendEvent>) -> (BackendEvent, usize) {
    let mut progress_events = 0;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("no event")
            .expect("channel closed");
        match event {
            BackendEvent::Progress(_) => progress_events += 1,
            other => return (other, progress_events),
        }
    }
}

#[tokio::test]
async fn test_actor_reports_completion() {
    let temp = TempDir::new().unwrap();
    let data = sample_bytes(4000);
    let fetcher = Arc::new(MockFetcher::new().with_file(URL, data.clone()));
    let (commands, mut events, handle) = spawn_actor(&temp, fetcher);
    let dest = temp.path().join("out");

    commands
        .send(BackendCommand::Start {
            files: vec![FileTarget::new(URL, "weights.bin")],
            destination: dest.clone(),
        })
        .await
        .unwrap();

    let (event, progress_events) = next_terminal(&mut events).await;
    assert!(matches!(event, BackendEvent::Completed));
    assert!(progress_events > 0);
    assert_eq!(std::fs::read(dest.join("weights.bin")).unwrap(), data);

    commands.send(BackendCommand::Shutdown).await.unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_actor_reports_resumable_failure() {
    let temp = TempDir::new().unwrap();
    let fetcher = Arc::new(MockFetcher::new().with_file(URL, sample_bytes(4000)));
    fetcher.fail_chunk("weights.bin_2", 5, 502);
    let (commands, mut events, handle) = spawn_actor(&temp, fetcher);

    commands
        .send(BackendCommand::Start {
            files: vec![FileTarget::new(URL, "weights.bin")],
            destination: temp.path().join("out"),
        })
        .await
        .unwrap();

    match next_terminal(&mut events).await.0 {
        BackendEvent::Failed {
            message,
            can_resume,
        } => {
            assert!(can_resume);
            assert!(message.contains("502"), "{}", message);
        }
        other => panic!("unexpected event {:?}", other),
    }

    commands.send(BackendCommand::Resume).await.unwrap();
    assert!(matches!(
        next_terminal(&mut events).await.0,
        BackendEvent::Completed
    ));

    commands.send(BackendCommand::Shutdown).await.unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_actor_reports_rejected_start_once() {
    let temp = TempDir::new().unwrap();
    let (commands, mut events, handle) = spawn_actor(&temp, Arc::new(MockFetcher::new()));

    commands
        .send(BackendCommand::Start {
            files: vec![FileTarget::new("ftp://origin.test/x", "x.bin").with_size(1)],
            destination: temp.path().join("out"),
        })
        .await
        .unwrap();

    match next_terminal(&mut events).await.0 {
        BackendEvent::Error {
            message,
            can_resume,
        } => {
            assert!(message.contains("ftp://"));
            assert!(!can_resume);
        }
        other => panic!("unexpected event {:?}", other),
    }

    commands.send(BackendCommand::Shutdown).await.unwrap();
    handle.await.unwrap();

    // Only progress may follow; the failure was already reported
    while let Some(event) = events.recv().await {
        assert!(
            matches!(event, BackendEvent::Progress(_)),
            "duplicate failure event {:?}",
            event
        );
    }
}
