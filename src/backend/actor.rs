use super::messages::{BackendCommand, BackendEvent};
use crate::downloader::{DownloadEngine, ProgressSnapshot, SessionState};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

pub struct BackendActor {
    receiver: mpsc::Receiver<BackendCommand>,
    sender: mpsc::Sender<BackendEvent>,
    engine: DownloadEngine,
}

impl BackendActor {
    pub fn new(
        engine: DownloadEngine,
        receiver: mpsc::Receiver<BackendCommand>,
        sender: mpsc::Sender<BackendEvent>,
    ) -> Self {
        Self {
            receiver,
            sender,
            engine,
        }
    }

    pub async fn run(mut self) {
        info!("BackendActor started");

        // Forward engine snapshots as events
        let progress = self.engine.subscribe();
        let sender_monitor = self.sender.clone();
        let monitor = tokio::spawn(async move {
            Self::monitor_loop(progress, sender_monitor).await;
        });

        while let Some(cmd) = self.receiver.recv().await {
            let result = match cmd {
                BackendCommand::Start { files, destination } => {
                    self.engine.start(files, destination).await
                }
                BackendCommand::Pause => self.engine.pause().await,
                BackendCommand::Resume => self.engine.resume().await,
                BackendCommand::Cancel => self.engine.cancel().await,
                BackendCommand::Shutdown => {
                    info!("BackendActor shutting down");
                    if let Err(e) = self.engine.pause().await {
                        error!("Failed to pause on shutdown: {}", e);
                    }
                    break;
                }
            };

            if let Err(e) = result {
                let event = BackendEvent::Error {
                    message: e.to_string(),
                    can_resume: e.is_resumable(),
                };
                let _ = self.sender.send(event).await;
            }
        }

        monitor.abort();
    }

    async fn monitor_loop(
        mut progress: watch::Receiver<ProgressSnapshot>,
        sender: mpsc::Sender<BackendEvent>,
    ) {
        let mut last_state = progress.borrow().state;

        while progress.changed().await.is_ok() {
            let snapshot = progress.borrow_and_update().clone();
            let state = snapshot.state;

            let transition = if state != last_state {
                debug!("Session state {:?} -> {:?}", last_state, state);
                match state {
                    SessionState::Completed => Some(BackendEvent::Completed),
                    // A rejected start has no session; the command loop reports it
                    SessionState::Failed { .. } if snapshot.session_id.is_some() => {
                        Some(BackendEvent::Failed {
                            message: snapshot
                                .error_message
                                .clone()
                                .unwrap_or_else(|| "Download failed".to_string()),
                            can_resume: snapshot.can_resume,
                        })
                    }
                    _ => None,
                }
            } else {
                None
            };
            last_state = state;

            if sender.send(BackendEvent::Progress(snapshot)).await.is_err() {
                break;
            }
            if let Some(event) = transition {
                if sender.send(event).await.is_err() {
                    break;
                }
            }
        }
    }
}
