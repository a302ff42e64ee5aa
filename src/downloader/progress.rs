//! Progress tracking for download sessions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    Idle,
    Downloading,
    Paused,
    Completed,
    Failed {
        resumable: bool,
    },
}

impl SessionState {
    pub fn can_resume(&self) -> bool {
        matches!(
            self,
            SessionState::Paused | SessionState::Failed { resumable: true }
        )
    }
}

/// Per-file chunk counts for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileProgress {
    pub file_name: String,
    pub completed_chunks: usize,
    pub total_chunks: usize,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub merged: bool,
}

/// Snapshot published to observers after every chunk completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub session_id: Option<Uuid>,
    pub state: SessionState,
    /// In `[0, 1]`
    pub overall_progress: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub speed_bytes_per_sec: f64,
    /// `None` while speed is zero
    pub eta: Option<Duration>,
    pub is_downloading: bool,
    pub error_message: Option<String>,
    pub can_resume: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub files: Vec<FileProgress>,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

impl ProgressSnapshot {
    pub fn idle() -> Self {
        Self {
            session_id: None,
            state: SessionState::Idle,
            overall_progress: 0.0,
            downloaded_bytes: 0,
            total_bytes: 0,
            speed_bytes_per_sec: 0.0,
            eta: None,
            is_downloading: false,
            error_message: None,
            can_resume: false,
            started_at: None,
            files: Vec::new(),
        }
    }

    /// Fraction of `total` covered by `downloaded`, clamped to `[0, 1]`
    pub fn fraction(downloaded: u64, total: u64) -> f64 {
        if total == 0 {
            return 0.0;
        }
        (downloaded as f64 / total as f64).clamp(0.0, 1.0)
    }

    /// Remaining time at `speed`; `None` when speed is zero
    pub fn estimate_eta(downloaded: u64, total: u64, speed: f64) -> Option<Duration> {
        if downloaded >= total {
            return Some(Duration::ZERO);
        }
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64((total - downloaded) as f64 / speed))
    }

    pub fn percentage(&self) -> f64 {
        self.overall_progress * 100.0
    }
}

/// Session-average speed, resampled at most once per `min_interval`
#[derive(Debug, Clone)]
pub struct SpeedSampler {
    started_at: Instant,
    baseline_bytes: u64,
    last_sample_at: Option<Instant>,
    min_interval: Duration,
    speed: f64,
}

impl SpeedSampler {
    pub fn starting_at(now: Instant, baseline_bytes: u64, min_interval: Duration) -> Self {
        Self {
            started_at: now,
            baseline_bytes,
            last_sample_at: None,
            min_interval,
            speed: 0.0,
        }
    }

    /// Restart the clock, counting only bytes gathered from here on
    pub fn restart(&mut self, now: Instant, baseline_bytes: u64) {
        *self = Self::starting_at(now, baseline_bytes, self.min_interval);
    }

    pub fn sample(&mut self, now: Instant, downloaded_bytes: u64) -> f64 {
        if let Some(last) = self.last_sample_at {
            if now.duration_since(last) < self.min_interval {
                return self.speed;
            }
        }

        let elapsed = now.duration_since(self.started_at).as_secs_f64();
        if elapsed > 0.0 {
            let gained = downloaded_bytes.saturating_sub(self.baseline_bytes);
            self.speed = gained as f64 / elapsed;
        }
        self.last_sample_at = Some(now);
        self.speed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_snapshot() {
        let snapshot = ProgressSnapshot::idle();
        assert_eq!(snapshot.state, SessionState::Idle);
        assert_eq!(snapshot.overall_progress, 0.0);
        assert!(!snapshot.is_downloading);
        assert!(snapshot.eta.is_none());
    }

    #[test]
    fn test_fraction_is_clamped() {
        assert_eq!(ProgressSnapshot::fraction(0, 0), 0.0);
        assert!((ProgressSnapshot::fraction(500, 1000) - 0.5).abs() < 1e-9);
        assert_eq!(ProgressSnapshot::fraction(1500, 1000), 1.0);
    }

    #[test]
    fn test_eta() {
        assert_eq!(
            ProgressSnapshot::estimate_eta(500, 1000, 100.0),
            Some(Duration::from_secs(5))
        );
        assert_eq!(ProgressSnapshot::estimate_eta(100, 1000, 0.0), None);
        assert_eq!(
            ProgressSnapshot::estimate_eta(1000, 1000, 0.0),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_state_resume_flags() {
        assert!(SessionState::Paused.can_resume());
        assert!(SessionState::Failed { resumable: true }.can_resume());
        assert!(!SessionState::Failed { resumable: false }.can_resume());
        assert!(!SessionState::Completed.can_resume());
    }

    #[test]
    fn test_speed_sampler_rate_limits() {
        let start = Instant::now();
        let mut sampler = SpeedSampler::starting_at(start, 0, Duration::from_millis(250));

        let speed = sampler.sample(start + Duration::from_secs(1), 1000);
        assert!((speed - 1000.0).abs() < 1e-6);

        // Too soon: previous value is kept
        let speed = sampler.sample(start + Duration::from_millis(1100), 50_000);
        assert!((speed - 1000.0).abs() < 1e-6);

        let speed = sampler.sample(start + Duration::from_secs(2), 4000);
        assert!((speed - 2000.0).abs() < 1e-6);
    }

    #[test]
    fn test_speed_sampler_restart_ignores_prior_bytes() {
        let start = Instant::now();
        let mut sampler = SpeedSampler::starting_at(start, 0, Duration::ZERO);
        sampler.sample(start + Duration::from_secs(1), 10_000);

        let resumed = start + Duration::from_secs(60);
        sampler.restart(resumed, 10_000);
        let speed = sampler.sample(resumed + Duration::from_secs(2), 12_000);
        assert!((speed - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_string(&ProgressSnapshot::idle()).unwrap();
        assert!(json.contains("\"state\":\"Idle\""));
    }
}
