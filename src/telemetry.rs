use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::AppConfig;
use crate::errors::AppResult;

const BUFFER_FILE: &str = "run-events.jsonl";

/// Append-only JSONL log of run events. Events queue in memory and land on
/// disk in batches; the buffer rotates once it grows past the configured
/// size, keeping a bounded number of rotated files.
#[derive(Clone)]
pub struct TelemetryLog {
    enabled: Arc<AtomicBool>,
    queue: Arc<Mutex<Vec<RunEvent>>>,
    buffer_path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
    max_file_count: usize,
}

impl TelemetryLog {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &AppConfig) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let buffer_path = data_dir.join(BUFFER_FILE);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&buffer_path)?;

        Ok(Self {
            enabled: Arc::new(AtomicBool::new(config.telemetry_enabled_by_default)),
            queue: Arc::new(Mutex::new(Vec::new())),
            buffer_path,
            batch_size: config.telemetry_batch_size.max(1),
            max_file_bytes: config.telemetry_buffer_max_bytes,
            max_file_count: config.telemetry_buffer_max_files,
        })
    }

    pub fn record(&self, name: impl Into<String>, payload: serde_json::Value) -> AppResult<()> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }

        let mut queue = self.queue.lock();
        queue.push(RunEvent::new(name.into(), payload));
        if queue.len() >= self.batch_size {
            self.drain_locked(&mut queue)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.drain_locked(&mut queue)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn buffer_path(&self) -> &Path {
        &self.buffer_path
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn drain_locked(&self, queue: &mut Vec<RunEvent>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }

        let mut encoded = Vec::with_capacity(queue.len());
        let mut incoming_bytes = 0_u64;
        for event in queue.iter() {
            let line = serde_json::to_vec(event)?;
            incoming_bytes += (line.len() + 1) as u64;
            encoded.push(line);
        }

        self.rotate_if_needed(incoming_bytes)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.buffer_path)?;
        for line in &encoded {
            file.write_all(line)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;

        queue.clear();
        Ok(())
    }

    fn rotate_if_needed(&self, incoming_bytes: u64) -> AppResult<()> {
        let current_size = fs::metadata(&self.buffer_path)
            .map(|m| m.len())
            .unwrap_or(0);
        if current_size + incoming_bytes <= self.max_file_bytes {
            return Ok(());
        }

        if self.max_file_count <= 1 {
            // No rotation budget: truncate in place.
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.buffer_path)?;
            return Ok(());
        }

        let rotated_name = format!(
            "{}-{}.jsonl",
            self.buffer_stem(),
            Utc::now().format("%Y%m%d%H%M%S")
        );
        let parent = self.buffer_path.parent().unwrap_or_else(|| Path::new("."));
        if self.buffer_path.exists() {
            fs::rename(&self.buffer_path, parent.join(rotated_name))?;
        }

        self.prune_rotations()?;
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.buffer_path)?;
        Ok(())
    }

    fn prune_rotations(&self) -> AppResult<()> {
        let parent = self.buffer_path.parent().unwrap_or_else(|| Path::new("."));
        let prefix = format!("{}-", self.buffer_stem());
        let mut rotations = fs::read_dir(parent)?
            .filter_map(|entry| {
                entry.ok().and_then(|dir_entry| {
                    let name = dir_entry.file_name();
                    let name = name.to_string_lossy();
                    if name.starts_with(&prefix) && name.ends_with(".jsonl") {
                        Some((
                            dir_entry.path(),
                            dir_entry.metadata().ok()?.modified().ok()?,
                        ))
                    } else {
                        None
                    }
                })
            })
            .collect::<Vec<_>>();

        rotations.sort_by_key(|(_, modified)| *modified);
        let allowed = self.max_file_count.saturating_sub(1);
        if rotations.len() > allowed {
            let excess = rotations.len() - allowed;
            for (path, _) in rotations.into_iter().take(excess) {
                let _ = fs::remove_file(path);
            }
        }
        Ok(())
    }

    fn buffer_stem(&self) -> String {
        self.buffer_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "run-events".into())
    }
}

#[derive(Debug, Serialize)]
pub struct RunEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl RunEvent {
    fn new(name: String, payload: serde_json::Value) -> Self {
        Self {
            name,
            timestamp: Utc::now(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::from_env();
        config.telemetry_enabled_by_default = true;
        config.telemetry_batch_size = 2;
        config.telemetry_buffer_max_bytes = 1024;
        config.telemetry_buffer_max_files = 3;
        config
    }

    #[test]
    fn flushes_events_to_disk() {
        let dir = tempdir().unwrap();
        let log = TelemetryLog::new(dir.path(), &test_config()).unwrap();

        log.record("run_started", json!({ "employees": 12 })).unwrap();
        assert_eq!(log.queue_depth(), 1);
        log.flush().unwrap();
        assert_eq!(log.queue_depth(), 0);

        let buffer = fs::read_to_string(log.buffer_path()).unwrap();
        assert!(buffer.contains("run_started"));
        assert!(buffer.contains("\"employees\":12"));
    }

    #[test]
    fn batch_threshold_triggers_a_write() {
        let dir = tempdir().unwrap();
        let log = TelemetryLog::new(dir.path(), &test_config()).unwrap();

        log.record("entity_unresolved", json!({ "id": "W1" })).unwrap();
        log.record("entity_unresolved", json!({ "id": "W2" })).unwrap();

        assert_eq!(log.queue_depth(), 0);
        let buffer = fs::read_to_string(log.buffer_path()).unwrap();
        assert_eq!(buffer.lines().count(), 2);
    }

    #[test]
    fn disabled_log_drops_events() {
        let dir = tempdir().unwrap();
        let log = TelemetryLog::new(dir.path(), &test_config()).unwrap();
        log.set_enabled(false);

        log.record("run_started", json!({})).unwrap();
        log.flush().unwrap();

        let buffer = fs::read_to_string(log.buffer_path()).unwrap();
        assert!(buffer.is_empty());
    }

    #[test]
    fn buffer_survives_restart() {
        let dir = tempdir().unwrap();
        let config = test_config();
        {
            let log = TelemetryLog::new(dir.path(), &config).unwrap();
            log.record("first_run", json!({})).unwrap();
            log.flush().unwrap();
        }

        let log = TelemetryLog::new(dir.path(), &config).unwrap();
        log.record("second_run", json!({})).unwrap();
        log.flush().unwrap();

        let buffer = fs::read_to_string(log.buffer_path()).unwrap();
        assert!(buffer.contains("first_run"));
        assert!(buffer.contains("second_run"));
    }

    #[test]
    fn rotates_and_prunes_old_buffers() {
        let dir = tempdir().unwrap();
        let mut config = test_config();
        config.telemetry_batch_size = 1;
        config.telemetry_buffer_max_bytes = 64;
        config.telemetry_buffer_max_files = 2;
        let log = TelemetryLog::new(dir.path(), &config).unwrap();

        for i in 0..5 {
            log.record("bulk", json!({ "padding": "0123456789abcdef0123456789abcdef", "i": i }))
                .unwrap();
            log.flush().unwrap();
        }

        let rotated = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("run-events-"))
            .count();
        assert_eq!(rotated, 1, "pruning keeps at most one rotation");
    }
}
