//! Crash-loop protection. A supervisor restarting the daemon in a tight
//! loop would otherwise hammer the socket and the log; repeated starts
//! inside the window earn an increasing sleep before the listener binds.

use chrono::{DateTime, Utc};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::cmp;
use std::path::Path;
use std::thread;
use std::time::Duration as StdDuration;
use tracing::warn;

const WINDOW_SECS: i64 = 90;
const FREE_STARTS: usize = 3;
const BACKOFF_STEP_SECS: u64 = 5;
const BACKOFF_MAX_SECS: u64 = 45;

#[derive(Default, Serialize, Deserialize)]
struct StartHistory {
    /// Recent start times as epoch milliseconds.
    starts_ms: Vec<i64>,
}

pub fn apply_startup_backoff(path: &Path) {
    let now = Utc::now();
    let mut history = load_history(path).unwrap_or_default();
    let backoff_secs = record_start(now, &mut history);

    if let Err(err) = save_history(path, &history) {
        warn!(error = %err, "Failed to persist daemon start history");
    }

    if let Some(secs) = backoff_secs {
        warn!(
            recent_starts = history.starts_ms.len(),
            backoff_secs = secs,
            "Daemon restarting too fast; backing off"
        );
        thread::sleep(StdDuration::from_secs(secs));
    }
}

fn record_start(now: DateTime<Utc>, history: &mut StartHistory) -> Option<u64> {
    let window_start = now.timestamp_millis() - WINDOW_SECS * 1000;
    history.starts_ms.retain(|start| *start >= window_start);
    history.starts_ms.push(now.timestamp_millis());

    let extra = history.starts_ms.len().checked_sub(FREE_STARTS + 1)?;
    let backoff = BACKOFF_STEP_SECS.saturating_mul(extra as u64 + 1);
    Some(cmp::min(backoff, BACKOFF_MAX_SECS))
}

fn load_history(path: &Path) -> Result<StartHistory, String> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(StartHistory::default())
        }
        Err(err) => return Err(format!("Failed to read start history: {}", err)),
    };
    serde_json::from_slice(&data).map_err(|err| format!("Failed to parse start history: {}", err))
}

fn save_history(path: &Path, history: &StartHistory) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("Failed to create daemon state dir: {}", err))?;
    }

    let payload = serde_json::to_vec_pretty(history)
        .map_err(|err| format!("Failed to serialize start history: {}", err))?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, payload)
        .map_err(|err| format!("Failed to write start history: {}", err))?;
    fs::rename(&tmp_path, path).map_err(|err| format!("Failed to commit start history: {}", err))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn free_starts_incur_no_backoff() {
        let now = Utc::now();
        let mut history = StartHistory {
            starts_ms: vec![
                (now - Duration::seconds(10)).timestamp_millis(),
                (now - Duration::seconds(20)).timestamp_millis(),
            ],
        };
        assert_eq!(record_start(now, &mut history), None);
        assert_eq!(history.starts_ms.len(), 3);
    }

    #[test]
    fn backoff_grows_past_the_threshold() {
        let now = Utc::now();
        let mut history = StartHistory {
            starts_ms: vec![
                (now - Duration::seconds(5)).timestamp_millis(),
                (now - Duration::seconds(10)).timestamp_millis(),
                (now - Duration::seconds(15)).timestamp_millis(),
            ],
        };
        assert_eq!(record_start(now, &mut history), Some(BACKOFF_STEP_SECS));
        assert_eq!(record_start(now, &mut history), Some(BACKOFF_STEP_SECS * 2));
    }

    #[test]
    fn starts_outside_the_window_are_forgotten() {
        let now = Utc::now();
        let mut history = StartHistory {
            starts_ms: vec![
                (now - Duration::seconds(WINDOW_SECS + 5)).timestamp_millis(),
                (now - Duration::seconds(WINDOW_SECS + 60)).timestamp_millis(),
            ],
        };
        assert_eq!(record_start(now, &mut history), None);
        assert_eq!(history.starts_ms.len(), 1);
    }

    #[test]
    fn backoff_is_capped() {
        let now = Utc::now();
        let mut history = StartHistory {
            starts_ms: vec![now.timestamp_millis(); 30],
        };
        assert_eq!(record_start(now, &mut history), Some(BACKOFF_MAX_SECS));
    }
}
