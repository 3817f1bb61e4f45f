//! Hot-reload watcher for `admin-config.json`.
//!
//! [`AdminConfigWatcher`] uses the `notify` crate to watch the admin
//! configuration file. When a change is detected it re-parses the file and
//! atomically updates the shared `Arc<RwLock<AdminConfig>>` that the
//! identity resolver and adapters read from.
//!
//! Whitelists and user mappings can therefore be edited without a restart;
//! all other configuration requires one.
//!
//! ## Thread safety
//!
//! The shared `Arc<std::sync::RwLock<AdminConfig>>` is updated from inside a
//! synchronous `notify` callback. `std::sync::RwLock` (not the tokio one) is
//! used intentionally so that the callback does not need an async context.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{info, warn};

use crate::config::AdminConfig;
use crate::{AppError, Result};

/// Returns `true` for file-system events that indicate the watched file was
/// written or replaced (create, modify, remove).
fn is_config_change(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Hot-reload watcher for the administrative configuration.
///
/// Holds a [`notify`] file-system watcher alive for its own lifetime.
/// Dropping an `AdminConfigWatcher` stops the underlying OS watch, so
/// callers must keep it alive for as long as hot-reload is needed.
pub struct AdminConfigWatcher {
    /// Underlying notify watcher — kept alive by owning it here.
    _watcher: RecommendedWatcher,
    /// Shared, hot-reloadable admin configuration.
    shared: Arc<RwLock<AdminConfig>>,
}

impl AdminConfigWatcher {
    /// Create a watcher for `path`, seeding the shared state from the file.
    ///
    /// A missing or malformed file yields defaults with a warning — the
    /// server still starts without an admin configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the OS watch cannot be registered on
    /// the file's parent directory.
    pub fn new(path: &Path) -> Result<Self> {
        let shared = Arc::new(RwLock::new(AdminConfig::load_or_default(path)));
        let watch_target: PathBuf = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let reload_path = path.to_path_buf();
        let reload_shared = Arc::clone(&shared);

        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) => {
                    if !is_config_change(&event) {
                        return;
                    }
                    if !event.paths.iter().any(|p| p.ends_with("admin-config.json")) {
                        return;
                    }
                    let reloaded = AdminConfig::load_or_default(&reload_path);
                    match reload_shared.write() {
                        Ok(mut guard) => {
                            *guard = reloaded;
                            info!("admin config reloaded");
                        }
                        Err(err) => warn!(%err, "admin config lock poisoned; reload skipped"),
                    }
                }
                Err(err) => warn!(%err, "admin config watch error"),
            },
        )
        .map_err(|err| AppError::Config(format!("failed to create admin config watcher: {err}")))?;

        // Watch the parent directory so atomic replace (write-temp-rename)
        // is observed even when editors swap the inode.
        watcher
            .watch(&watch_target, RecursiveMode::NonRecursive)
            .map_err(|err| {
                AppError::Config(format!(
                    "failed to watch {}: {err}",
                    watch_target.display()
                ))
            })?;

        Ok(Self {
            _watcher: watcher,
            shared,
        })
    }

    /// The shared admin configuration handle.
    #[must_use]
    pub fn shared(&self) -> Arc<RwLock<AdminConfig>> {
        Arc::clone(&self.shared)
    }
}
