use crate::downloader::{FileTarget, ProgressSnapshot};
use std::path::PathBuf;

/// Commands sent from the front end to the backend
#[derive(Debug, Clone)]
pub enum BackendCommand {
    Start {
        files: Vec<FileTarget>,
        destination: PathBuf,
    },
    Pause,
    Resume,
    Cancel,
    // System
    Shutdown,
}

/// Events sent from the backend to the front end
#[derive(Debug, Clone)]
pub enum BackendEvent {
    Progress(ProgressSnapshot),
    Completed,
    Failed { message: String, can_resume: bool },

    // Command rejected by the engine
    Error { message: String, can_resume: bool },
}
