//! Filesystem watching and debounced hot reload of module files.
//!
//! The watcher mirrors how modules arrive in practice: a file dropped into
//! the modules directory is loaded, an overwritten file is reloaded, a
//! deleted file is unloaded. Rapid successive writes (copies in progress,
//! linkers finishing up) are debounced per path before a reload fires.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ModulesConfig;
use crate::logging::LogSink;
use crate::manager::ModuleManager;
use crate::platform::is_module_file;

/// Default settle time between the last write to a file and its reload.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(200);

/// Pending per-path debounce timers, shared so drop can cancel them.
type Timers = Arc<Mutex<HashMap<PathBuf, JoinHandle<()>>>>;

/// Watches a modules directory and drives the lifecycle manager.
pub struct ModuleWatcher {
    _watcher: RecommendedWatcher,
    handle: JoinHandle<()>,
    timers: Timers,
}

impl ModuleWatcher {
    /// Load every module file already under `root`, then watch the tree
    /// for changes. Must be called from within a tokio runtime.
    pub fn spawn(
        manager: Arc<ModuleManager>,
        root: &Path,
        debounce: Duration,
    ) -> Result<Self, notify::Error> {
        scan_existing(&manager, root);

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => tracing::error!(error = %e, "filesystem watcher error"),
            },
            notify::Config::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        tracing::info!(root = %root.display(), "watching modules directory");

        let timers: Timers = Arc::new(Mutex::new(HashMap::new()));
        let handle = tokio::spawn(run(manager, rx, debounce, timers.clone()));
        Ok(Self {
            _watcher: watcher,
            handle,
            timers,
        })
    }

    /// Build a manager from settings and watch its modules directory. Wires
    /// the mirror directory through so sources stay replaceable while
    /// their staged copies are loaded.
    pub fn spawn_from_config(
        config: &ModulesConfig,
        sink: Arc<dyn LogSink>,
    ) -> Result<(Arc<ModuleManager>, Self), notify::Error> {
        let manager = Arc::new(match &config.mirror {
            Some(mirror) => ModuleManager::with_mirror(sink, mirror.clone()),
            None => ModuleManager::new(sink),
        });
        let watcher = Self::spawn(manager.clone(), &config.path, config.debounce())?;
        Ok((manager, watcher))
    }
}

impl Drop for ModuleWatcher {
    fn drop(&mut self) {
        self.handle.abort();
        // Pending debounce timers must not fire a reload after the watcher
        // is gone.
        for (_, timer) in self.timers.lock().drain() {
            timer.abort();
        }
    }
}

async fn run(
    manager: Arc<ModuleManager>,
    mut rx: mpsc::UnboundedReceiver<notify::Event>,
    debounce: Duration,
    timers: Timers,
) {
    while let Some(event) = rx.recv().await {
        timers.lock().retain(|_, t| !t.is_finished());

        for path in event.paths {
            if path.is_dir() || manager.is_staged(&path) {
                continue;
            }
            match event.kind {
                EventKind::Create(_) | EventKind::Modify(_) => {
                    // A rename away from the watched tree arrives as a
                    // modify event for a path that no longer exists.
                    if !path.exists() {
                        if let Some(t) = timers.lock().remove(&path) {
                            t.abort();
                        }
                        unload_path(&manager, &path);
                        continue;
                    }
                    if !is_module_file(&path) {
                        continue;
                    }
                    tracing::debug!(path = %path.display(), "module file changed");
                    if let Some(t) = timers.lock().remove(&path) {
                        t.abort();
                    }
                    let manager = manager.clone();
                    let target = path.clone();
                    timers.lock().insert(
                        path,
                        tokio::spawn(async move {
                            tokio::time::sleep(debounce).await;
                            match manager.reload(&target) {
                                Ok(muid) => {
                                    tracing::info!(path = %target.display(), %muid, "module (re)loaded")
                                }
                                Err(e) => {
                                    tracing::warn!(path = %target.display(), error = %e, "module reload failed")
                                }
                            }
                        }),
                    );
                }
                EventKind::Remove(_) => {
                    if let Some(t) = timers.lock().remove(&path) {
                        t.abort();
                    }
                    unload_path(&manager, &path);
                }
                _ => {}
            }
        }
    }
}

fn unload_path(manager: &ModuleManager, path: &Path) {
    match manager.remove(path) {
        Ok(Some(muid)) => {
            tracing::info!(path = %path.display(), %muid, "module removed with its file")
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "unload on removal failed"),
    }
}

/// Initial scan: attempt a load for every module file already present.
fn scan_existing(manager: &ModuleManager, root: &Path) {
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            tracing::warn!(dir = %dir.display(), "skipping unreadable directory during scan");
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if manager.is_staged(&path) {
                continue;
            }
            if path.is_dir() {
                pending.push(path);
            } else if is_module_file(&path) {
                if let Err(e) = manager.load(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "initial module load failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::test_support::RecordingSink;
    use crate::module::ModuleState;

    async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn dropped_file_triggers_a_load_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(ModuleManager::new(Arc::new(RecordingSink::default())));
        let _watcher = ModuleWatcher::spawn(
            manager.clone(),
            dir.path(),
            Duration::from_millis(50),
        )
        .unwrap();

        let target = dir.path().join("libjunk.so");
        std::fs::write(&target, b"not a real library").unwrap();

        assert!(
            wait_for(|| manager.muid_for_path(&target).is_some()).await,
            "watcher never attempted the load"
        );
        let muid = manager.muid_for_path(&target).unwrap();
        assert_eq!(manager.state(muid), Some(ModuleState::Failed));

        std::fs::remove_file(&target).unwrap();
        assert!(
            wait_for(|| manager.muid_for_path(&target).is_none()).await,
            "watcher never processed the removal"
        );
    }

    #[tokio::test]
    async fn pending_debounce_is_cancelled_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(ModuleManager::new(Arc::new(RecordingSink::default())));
        let watcher = ModuleWatcher::spawn(
            manager.clone(),
            dir.path(),
            Duration::from_millis(500),
        )
        .unwrap();

        let target = dir.path().join("liblate.so");
        std::fs::write(&target, b"junk").unwrap();
        // Let the event reach the loop and arm its timer, then drop the
        // watcher before the debounce elapses.
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(watcher);
        tokio::time::sleep(Duration::from_millis(700)).await;

        assert!(
            manager.muid_for_path(&target).is_none(),
            "a timer fired after the watcher was dropped"
        );
    }

    #[tokio::test]
    async fn config_wires_mirror_staging_into_the_watcher() {
        let dir = tempfile::tempdir().unwrap();
        let mods = dir.path().join("mods");
        std::fs::create_dir_all(&mods).unwrap();
        let mirror = dir.path().join("mirror");
        let config = crate::config::ModulesConfig {
            path: mods.clone(),
            mirror: Some(mirror.clone()),
            debounce_ms: 50,
        };

        let (manager, _watcher) =
            ModuleWatcher::spawn_from_config(&config, Arc::new(RecordingSink::default()))
                .unwrap();

        let target = mods.join("libjunk.so");
        std::fs::write(&target, b"not a real library").unwrap();
        assert!(
            wait_for(|| manager.muid_for_path(&target).is_some()).await,
            "watcher never attempted the load"
        );

        // The staged copy exists and the record answers to the source path.
        assert!(mirror.join("libjunk.so").exists());
        let muid = manager.muid_for_path(&target).unwrap();
        assert_eq!(manager.state(muid), Some(ModuleState::Failed));
        assert!(manager.muid_for_path(&mirror.join("libjunk.so")).is_none());
    }

    #[tokio::test]
    async fn existing_files_are_scanned_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("libpre.so");
        std::fs::write(&target, b"junk").unwrap();
        std::fs::write(dir.path().join("ignore.txt"), b"x").unwrap();

        let manager = Arc::new(ModuleManager::new(Arc::new(RecordingSink::default())));
        let _watcher =
            ModuleWatcher::spawn(manager.clone(), dir.path(), DEFAULT_DEBOUNCE).unwrap();

        assert!(manager.muid_for_path(&target).is_some());
        assert!(manager
            .muid_for_path(&dir.path().join("ignore.txt"))
            .is_none());
    }
}
