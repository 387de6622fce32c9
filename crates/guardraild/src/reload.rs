//! Config file watcher.
//!
//! Polls the file's modification time and revalidates on change. A rejected
//! file leaves the running configuration untouched.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tracing::{debug, info};

use guardrail_core::{AuditAction, AuditEvent, AuditSink, ConfigHandle, Scope};
use guardrail_reconcile::epoch_secs;

pub struct ConfigReloader {
    path: PathBuf,
    handle: ConfigHandle,
    audit: Arc<dyn AuditSink>,
    last_modified: Option<SystemTime>,
}

impl ConfigReloader {
    pub fn new(path: impl Into<PathBuf>, handle: ConfigHandle, audit: Arc<dyn AuditSink>) -> Self {
        let path = path.into();
        let last_modified = modified(&path);
        Self {
            path,
            handle,
            audit,
            last_modified,
        }
    }

    /// Reload if the file changed since the last check. Returns whether a
    /// reload was attempted.
    pub fn check(&mut self) -> bool {
        let current = modified(&self.path);
        if current.is_none() || current == self.last_modified {
            return false;
        }
        self.last_modified = current;

        let event = match self.handle.reload_from_file(&self.path) {
            Ok(config) => AuditEvent::new(
                epoch_secs(),
                Scope::Global,
                AuditAction::ConfigReloaded,
                format!("{} reloaded", self.path.display()),
            )
            .with_change(None, Some(format!("{:?}", config.mode))),
            Err(e) => AuditEvent::new(
                epoch_secs(),
                Scope::Global,
                AuditAction::ConfigRejected,
                e.to_string(),
            ),
        };
        self.audit.record(event);
        true
    }

    /// Poll every `interval` until shutdown.
    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(path = %self.path.display(), "config watcher started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if self.check() {
                        debug!(path = %self.path.display(), "config change handled");
                    }
                }
                _ = shutdown.changed() => {
                    info!("config watcher shutting down");
                    break;
                }
            }
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardrail_core::{GuardrailConfig, MemorySink, Mode};

    fn touch_later(path: &Path, content: &str, previous: Option<SystemTime>) {
        // Some filesystems have coarse mtimes; write until the stamp moves.
        loop {
            std::fs::write(path, content).unwrap();
            if modified(path) != previous {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn reloads_on_change_and_keeps_last_good_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guardrail.toml");
        std::fs::write(&path, "mode = \"dry_run\"\n").unwrap();

        let handle = ConfigHandle::new(GuardrailConfig::from_file(&path).unwrap());
        let sink = Arc::new(MemorySink::new());
        let mut reloader = ConfigReloader::new(&path, handle.clone(), sink.clone());

        assert!(!reloader.check());

        touch_later(&path, "mode = \"enforce\"\n", reloader.last_modified);
        assert!(reloader.check());
        assert_eq!(handle.current().mode, Mode::Enforce);
        assert_eq!(sink.audit_with(AuditAction::ConfigReloaded).len(), 1);

        touch_later(&path, "mode = \"sideways\"\n", reloader.last_modified);
        assert!(reloader.check());
        assert_eq!(handle.current().mode, Mode::Enforce);
        assert_eq!(sink.audit_with(AuditAction::ConfigRejected).len(), 1);
    }

    #[test]
    fn missing_file_is_not_a_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let sink = Arc::new(MemorySink::new());
        let mut reloader =
            ConfigReloader::new(&path, ConfigHandle::new(GuardrailConfig::default()), sink.clone());
        assert!(!reloader.check());
        assert!(sink.audit_events().is_empty());
    }
}
