//! Config hot-reload watcher.
//!
//! Watches `cadence.toml` while `cadence serve` runs and invokes a callback
//! with the freshly parsed [`CadenceConfig`] after a debounce window. Only
//! settings that are safe to change under a running control loop are applied
//! by the caller; today that is the log level.

use crate::config::{parse_config, CadenceConfig};
use cadence_core::{CadenceError, CadenceResult};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;

/// Calls back on every debounced change of a config file.
///
/// Dropping it releases the file-system watch, which ends the reload thread.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `config_path`.
    ///
    /// Parse errors are logged and do not invoke `on_reload`, so a half-saved
    /// file never replaces a working configuration.
    pub fn start<F>(config_path: PathBuf, debounce_ms: u64, on_reload: F) -> CadenceResult<Self>
    where
        F: Fn(CadenceConfig) + Send + 'static,
    {
        let (tx, rx) = std_mpsc::channel();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    let _ = tx.send(());
                }
            }
        })
        .map_err(|e| CadenceError::Config(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(&config_path, RecursiveMode::NonRecursive)
            .map_err(|e| CadenceError::Config(format!("Failed to watch config file: {e}")))?;

        let path = config_path.clone();
        std::thread::spawn(move || {
            let debounce = std::time::Duration::from_millis(debounce_ms);

            while rx.recv().is_ok() {
                // Editors write in bursts; settle, then reload once.
                std::thread::sleep(debounce);
                while rx.try_recv().is_ok() {}

                match parse_config(&path) {
                    Ok(config) => on_reload(config),
                    Err(e) => tracing::warn!(error = %e, "Failed to reload config"),
                }
            }

            tracing::debug!("Config watcher thread exiting");
        });

        tracing::info!(path = %config_path.display(), "Config hot-reload watcher started");

        Ok(Self { _watcher: watcher })
    }
}
