//! Tracing initialization and per-stage debug snapshots.

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

pub const ENV_STAGE_LOG: &str = "ROUTECODEX_STAGE_LOG";

/// Initialize the global tracing subscriber once.
pub fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Best-effort per-stage snapshot writer.
///
/// When enabled, each stage of a request writes
/// `<dir>/<requestId>_<stage>.json`. Failures are swallowed: snapshots are
/// a debugging aid, never on the request's critical path.
pub struct StageLogger {
    dir: Option<PathBuf>,
}

impl StageLogger {
    #[must_use]
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    /// Enabled iff `ROUTECODEX_STAGE_LOG` is set truthy; snapshots land
    /// under `<home>/.routecodex/golden_samples`.
    #[must_use]
    pub fn from_env(home: Option<&std::path::Path>) -> Self {
        let enabled = std::env::var(ENV_STAGE_LOG)
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let dir = match (enabled, home) {
            (true, Some(home)) => Some(home.join(".routecodex/golden_samples")),
            _ => None,
        };
        Self { dir }
    }

    #[must_use]
    pub fn with_dir(dir: PathBuf) -> Self {
        Self { dir: Some(dir) }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.dir.is_some()
    }

    /// Write one stage snapshot, best-effort.
    pub fn log_json(&self, request_id: &str, stage: &str, value: &serde_json::Value) {
        let Some(dir) = self.dir.as_deref() else {
            return;
        };
        let stage: String = stage
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let path = dir.join(format!("{request_id}_{stage}.json"));
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(dir)?;
            let body = serde_json::to_vec_pretty(value)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            std::fs::write(path, body)
        };
        if let Err(err) = write() {
            tracing::debug!(error = %err, "stage snapshot write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_use_request_id_and_stage_in_the_filename() {
        let dir = tempfile::tempdir().unwrap();
        let logger = StageLogger::with_dir(dir.path().to_path_buf());
        logger.log_json("req_abc", "outbound", &serde_json::json!({"ok": true}));
        let path = dir.path().join("req_abc_outbound.json");
        let raw = std::fs::read_to_string(path).unwrap();
        assert!(raw.contains("\"ok\""));
    }

    #[test]
    fn disabled_logger_writes_nothing() {
        let logger = StageLogger::disabled();
        assert!(!logger.enabled());
        logger.log_json("req", "stage", &serde_json::json!({}));
    }
}
