//! Versioned, swappable policy configuration.
//!
//! Readers take a cheap `Arc` snapshot; the single writer builds a modified
//! copy and swaps it in, bumping the version. A snapshot taken before an update
//! keeps the old policy for the rest of that check.

use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::policy::{Policy, PolicyTable};
use crate::error::Result;

/// An immutable view of the policy table at one version.
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    pub version: u64,
    pub table: Arc<PolicyTable>,
}

/// Holder of the live policy table.
#[derive(Debug)]
pub struct PolicyRegistry {
    current: RwLock<PolicySnapshot>,
    /// Serializes writers so read-modify-swap never loses an update.
    writer: Mutex<()>,
}

impl PolicyRegistry {
    /// Create a registry at version 1.
    pub fn new(table: PolicyTable) -> Self {
        Self {
            current: RwLock::new(PolicySnapshot {
                version: 1,
                table: Arc::new(table),
            }),
            writer: Mutex::new(()),
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> PolicySnapshot {
        self.current.read().clone()
    }

    /// Current version.
    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// Apply a mutation to a copy of the table and publish it if it changed.
    ///
    /// Returns the resulting version and whether a new version was published.
    pub fn update<F>(&self, mutate: F) -> Result<(u64, bool)>
    where
        F: FnOnce(&mut PolicyTable) -> Result<bool>,
    {
        let _guard = self.writer.lock();
        let base = self.snapshot();

        let mut table = (*base.table).clone();
        if !mutate(&mut table)? {
            return Ok((base.version, false));
        }

        let version = base.version + 1;
        *self.current.write() = PolicySnapshot {
            version,
            table: Arc::new(table),
        };
        debug!(version, "Published policy table");
        Ok((version, true))
    }

    /// Replace the whole table.
    pub fn replace(&self, table: PolicyTable) -> (u64, bool) {
        let outcome = self.update(|current| {
            if *current == table {
                return Ok(false);
            }
            *current = table;
            Ok(true)
        });
        // The closure above is infallible.
        outcome.unwrap_or((self.version(), false))
    }

    pub fn upsert(&self, policy: Policy) -> Result<(u64, bool)> {
        self.update(|table| table.upsert(policy))
    }

    pub fn set_default(&self, policy: Policy) -> Result<(u64, bool)> {
        self.update(|table| table.set_default(policy))
    }

    pub fn remove(&self, scope: &str) -> Result<(u64, bool)> {
        self.update(|table| table.remove(scope).map(|_| true))
    }

    pub fn set_role_multiplier(&self, role: &str, multiplier: f64) -> Result<(u64, bool)> {
        self.update(|table| table.set_role_multiplier(role, multiplier))
    }

    /// Reload the table from a YAML file, publishing only on change.
    pub fn reload_from_file<P: AsRef<Path>>(&self, path: P) -> Result<(u64, bool)> {
        let table = PolicyTable::from_file(path.as_ref())?;
        let (version, changed) = self.replace(table);
        if changed {
            info!(
                path = %path.as_ref().display(),
                version,
                "Policy table reloaded"
            );
        }
        Ok((version, changed))
    }
}

/// Reload `path` into the registry every `interval` until the task is aborted.
///
/// A file that fails to load or validate is logged and the current table is
/// kept.
pub fn spawn_reloader(registry: Arc<PolicyRegistry>, path: PathBuf, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the table was loaded at startup.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = registry.reload_from_file(&path) {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Policy reload failed, keeping current table"
                );
            }
        }
    })
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new(PolicyTable::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatekeeperError;

    #[test]
    fn test_initial_version() {
        let registry = PolicyRegistry::default();
        assert_eq!(registry.version(), 1);
    }

    #[test]
    fn test_update_bumps_version_only_on_change() {
        let registry = PolicyRegistry::default();

        let (version, changed) = registry.upsert(Policy::new("/a", 5, 60)).unwrap();
        assert!(changed);
        assert_eq!(version, 2);

        let (version, changed) = registry.upsert(Policy::new("/a", 5, 60)).unwrap();
        assert!(!changed);
        assert_eq!(version, 2);
    }

    #[test]
    fn test_snapshot_is_not_retroactive() {
        let registry = PolicyRegistry::default();
        registry.upsert(Policy::new("/a", 5, 60)).unwrap();

        let before = registry.snapshot();
        registry.upsert(Policy::new("/a", 50, 60)).unwrap();

        assert_eq!(before.table.get("/a").unwrap().limit, 5);
        assert_eq!(registry.snapshot().table.get("/a").unwrap().limit, 50);
    }

    #[test]
    fn test_failed_update_keeps_table() {
        let registry = PolicyRegistry::default();
        let err = registry.remove("/missing").unwrap_err();
        assert!(matches!(err, GatekeeperError::PolicyNotFound(_)));
        assert_eq!(registry.version(), 1);
    }

    #[test]
    fn test_reload_from_file() {
        let path = std::env::temp_dir().join(format!(
            "gatekeeper-policies-{}.yaml",
            uuid::Uuid::new_v4()
        ));
        std::fs::write(
            &path,
            "endpoints:\n  - scope: /api/auth/login\n    limit: 5\n    window_secs: 60\n",
        )
        .unwrap();

        let registry = PolicyRegistry::default();
        let (version, changed) = registry.reload_from_file(&path).unwrap();
        assert!(changed);
        assert_eq!(version, 2);

        // Same content again does not publish a new version.
        let (version, changed) = registry.reload_from_file(&path).unwrap();
        assert!(!changed);
        assert_eq!(version, 2);

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_reloader_picks_up_changes_and_survives_bad_files() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("gatekeeper-reload-{}.yaml", uuid::Uuid::new_v4()));
        // Write then rename so the reloader never observes a partial file.
        let publish = |contents: &str| {
            let staged = dir.join(format!("gatekeeper-staged-{}.yaml", uuid::Uuid::new_v4()));
            std::fs::write(&staged, contents).unwrap();
            std::fs::rename(&staged, &path).unwrap();
        };

        publish("default_policy:\n  limit: 10\n  window_secs: 60\n");
        let registry = Arc::new(PolicyRegistry::new(PolicyTable::from_file(&path).unwrap()));
        let handle = spawn_reloader(registry.clone(), path.clone(), Duration::from_millis(10));

        publish("default_policy:\n  limit: 5\n  window_secs: 0\n");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.version(), 1);

        publish("default_policy:\n  limit: 20\n  window_secs: 60\n");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.version(), 2);
        assert_eq!(registry.snapshot().table.default_policy().limit, 20);

        handle.abort();
        std::fs::remove_file(&path).unwrap();
    }
}
