use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, Once};

use chrono::Utc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::run::RunKind;

// At most one run log is open per process.
static ACTIVE: Mutex<Option<BufWriter<File>>> = Mutex::new(None);
static INIT: Once = Once::new();

fn active() -> MutexGuard<'static, Option<BufWriter<File>>> {
    ACTIVE.lock().unwrap_or_else(|e| e.into_inner())
}

/// Routes formatted events into the open run log, or drops them.
struct ActiveRunLog;

struct ActiveRunLogWriter(MutexGuard<'static, Option<BufWriter<File>>>);

impl Write for ActiveRunLogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.0.as_mut() {
            Some(writer) => writer.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.0.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for ActiveRunLog {
    type Writer = ActiveRunLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        ActiveRunLogWriter(active())
    }
}

/// `APPVAULT_LOG` wins over `RUST_LOG`; an unparsable directive falls back to `debug`.
fn env_filter(app_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    app_log
        .or(rust_log)
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new("debug"))
}

fn init_tracing() {
    INIT.call_once(|| {
        let filter = env_filter(
            std::env::var("APPVAULT_LOG").ok().as_deref(),
            std::env::var("RUST_LOG").ok().as_deref(),
        );
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(ActiveRunLog);
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init();
    });
}

/// Flushes and closes the run log on drop.
pub struct RunLogGuard {
    path: PathBuf,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        if let Some(mut writer) = active().take() {
            let _ = writer.flush();
            let _ = writer.get_ref().sync_all();
        }
    }
}

/// Opens `run-{kind}-{utc}-{run_id}.ndjson` under the log dir; every tracing
/// event until the guard drops lands there as one JSON line.
pub fn start_run_log(kind: RunKind, run_id: &str, data_dir: &Path) -> std::io::Result<RunLogGuard> {
    init_tracing();

    let log_dir = std::env::var_os("APPVAULT_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("logs"));
    std::fs::create_dir_all(&log_dir)?;

    let run_id: String = run_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    let path = log_dir.join(format!(
        "run-{}-{}-{run_id}.ndjson",
        kind.as_str(),
        Utc::now().format("%Y%m%dT%H%M%SZ"),
    ));

    let mut slot = active();
    if slot.is_some() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "run log already active",
        ));
    }
    let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
    *slot = Some(BufWriter::new(file));

    Ok(RunLogGuard { path })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_log_wins_over_rust_log() {
        assert_eq!(
            env_filter(Some("appvault_core=trace"), Some("warn")).to_string(),
            "appvault_core=trace"
        );
        assert_eq!(env_filter(None, Some("warn")).to_string(), "warn");
        assert_eq!(env_filter(None, None).to_string(), "debug");
    }

    #[test]
    fn restore_run_log_holds_one_json_object_per_event() {
        let temp = tempfile::tempdir().unwrap();
        let guard = start_run_log(RunKind::Restore, "run:42", temp.path()).unwrap();

        let name = guard.path().file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("run-restore-"));
        assert!(name.ends_with("-run_42.ndjson"));
        assert_eq!(guard.path().parent(), Some(temp.path().join("logs").as_path()));
        assert!(start_run_log(RunKind::Backup, "other", temp.path()).is_err());

        tracing::info!(event = "run.start", kind = "restore", run_id = "run:42", "run.start");
        tracing::debug!(
            event = "slice.state",
            item_id = "package:com.app@0",
            data_type = "user",
            state = "processing",
            "slice.state"
        );
        tracing::info!(event = "run.finish", kind = "restore", run_id = "run:42", "run.finish");

        let path = guard.path().to_path_buf();
        drop(guard);

        let text = std::fs::read_to_string(&path).unwrap();
        let events: Vec<String> = text
            .lines()
            .map(|line| {
                let v: serde_json::Value = serde_json::from_str(line).unwrap();
                assert!(v.get("timestamp").is_some());
                v["fields"]["event"].as_str().unwrap_or_default().to_string()
            })
            .collect();
        assert!(events.contains(&"run.start".to_string()));
        assert!(events.contains(&"run.finish".to_string()));
    }
}
