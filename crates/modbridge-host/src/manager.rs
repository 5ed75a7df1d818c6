//! Lifecycle manager: load → version check → init → active → uninit → unload.
//!
//! Lifecycle operations on one identity are serialized through that
//! record's lock; operations on different identities proceed in parallel.
//! There is no timeout around a module's own init/uninit code — a hang in
//! foreign code is outside this layer's control.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use modbridge_abi::{
    ModuleInitFn, ModuleUninitFn, ModuleVersionFn, ABI_VERSION, INIT_SYMBOL,
    MODULE_VERSION_SYMBOL, UNINIT_SYMBOL,
};

use crate::capability::CapabilityBuilder;
use crate::error::{ErrorKind, LoadError, Result};
use crate::logging::LogSink;
use crate::module::{ModuleRecord, ModuleState};
use crate::muid::{Muid, MuidAllocator};
use crate::platform;
use crate::registry::RouteRegistry;
use crate::staging;

/// Orchestrates the lifecycle of every loaded module.
pub struct ModuleManager {
    registry: Arc<RouteRegistry>,
    builder: CapabilityBuilder,
    allocator: MuidAllocator,
    records: RwLock<HashMap<Muid, Arc<Mutex<ModuleRecord>>>>,
    /// Identity of the most recent load attempt per path key.
    by_path: Mutex<HashMap<PathBuf, Muid>>,
    /// When set, libraries are copied here and loaded from the copy.
    mirror: Option<PathBuf>,
}

impl ModuleManager {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        let registry = Arc::new(RouteRegistry::new());
        Self {
            builder: CapabilityBuilder::new(registry.clone(), sink),
            registry,
            allocator: MuidAllocator::new(),
            records: RwLock::new(HashMap::new()),
            by_path: Mutex::new(HashMap::new()),
            mirror: None,
        }
    }

    /// Manager that stages every library into `mirror` before loading it.
    /// The loaded copy, not the source file, is what the OS holds open, so
    /// the source stays replaceable while its module runs. Records are
    /// still keyed by the source path.
    pub fn with_mirror(sink: Arc<dyn LogSink>, mirror: PathBuf) -> Self {
        let mut manager = Self::new(sink);
        manager.mirror = Some(mirror);
        manager
    }

    /// Whether `path` lies inside the configured mirror directory. Staged
    /// copies must not be treated as module sources of their own.
    pub fn is_staged(&self, path: &Path) -> bool {
        self.mirror
            .as_deref()
            .is_some_and(|mirror| path_key(path).starts_with(path_key(mirror)))
    }

    /// The dispatch table modules register into. The HTTP engine performs
    /// its lookups against this.
    pub fn registry(&self) -> Arc<RouteRegistry> {
        self.registry.clone()
    }

    /// Copy `path` into the mirror directory, when one is configured.
    /// Returns the staged location to load from, or `None` when loading in
    /// place.
    fn stage(&self, path: &Path) -> Result<Option<PathBuf>> {
        let Some(mirror) = self.mirror.as_deref() else {
            return Ok(None);
        };
        let into_load_error = |message: String| LoadError::NoSuchModule {
            path: path.to_path_buf(),
            message,
        };
        let target = staging::staged_path(mirror, path)
            .ok_or_else(|| into_load_error("path has no file name".into()))?;
        std::fs::create_dir_all(mirror)
            .and_then(|()| staging::copy_atomic(path, &target))
            .map_err(|e| into_load_error(e.to_string()))?;
        tracing::debug!(src = %path.display(), dst = %target.display(), "staged module file");
        Ok(Some(target))
    }

    /// Load one module and run its entry point.
    ///
    /// On failure a `Failed` record remains queryable (by the returned
    /// path mapping) so the per-identity error register survives the call.
    /// When init itself reports failure the library stays open and any
    /// partial registrations stay live; the host decides whether to
    /// [`unload`](Self::unload).
    pub fn load(&self, path: &Path) -> Result<Muid> {
        let muid = self.allocator.allocate()?;
        let cell = Arc::new(Mutex::new(ModuleRecord::new(muid, path)));
        self.records.write().insert(muid, cell.clone());
        self.by_path.lock().insert(path_key(path), muid);
        let mut rec = cell.lock();

        tracing::info!(path = %path.display(), muid = %muid, "loading module");

        let staged = match self.stage(path) {
            Ok(s) => s,
            Err(e) => {
                rec.fail(ErrorKind::NoSuchModule);
                tracing::error!(path = %path.display(), error = %e, "staging module failed");
                return Err(e);
            }
        };
        let load_path = staged.as_deref().unwrap_or(path);

        let handle = match platform::open(load_path) {
            Ok(h) => h,
            Err(e) => {
                let kind = match e {
                    LoadError::UnsupportedPlatform => ErrorKind::UnsupportedPlatform,
                    _ => ErrorKind::NoSuchModule,
                };
                rec.fail(kind);
                tracing::error!(path = %path.display(), error = %e, "module load failed");
                return Err(e);
            }
        };

        // Until init has run the handle is closed again on any abort.
        let handle = scopeguard::guard(handle, |h| {
            if let Err(e) = h.close() {
                tracing::warn!(error = %e, "failed to close library after aborted load");
            }
        });

        let init: ModuleInitFn = match unsafe { handle.resolve(INIT_SYMBOL) } {
            Ok(f) => f,
            Err(message) => {
                rec.fail(ErrorKind::NoValidInitFunc);
                tracing::error!(path = %path.display(), %message, "module entry symbol missing");
                return Err(LoadError::NoValidInitFunc { message });
            }
        };

        rec.declared_version =
            unsafe { handle.resolve::<ModuleVersionFn>(MODULE_VERSION_SYMBOL) }
                .ok()
                .map(|f| unsafe { f() });
        if let Some(version) = rec.declared_version {
            if version < ABI_VERSION {
                tracing::warn!(
                    path = %path.display(),
                    module_version = version,
                    loader_version = ABI_VERSION,
                    "module version older than loader; continuing without compatibility guarantees"
                );
            }
        }

        let caps = self.builder.build(muid);
        let handle = scopeguard::ScopeGuard::into_inner(handle);
        let ok = unsafe { init(caps.table_ptr()) };
        rec.handle = Some(handle);
        rec.capabilities = Some(caps);

        if !ok {
            rec.fail(ErrorKind::InitFuncStateFail);
            tracing::warn!(path = %path.display(), muid = %muid, "module init reported failure");
            return Err(LoadError::InitFuncStateFail);
        }

        rec.state = ModuleState::Active;
        rec.last_error = ErrorKind::Success;
        tracing::info!(path = %path.display(), muid = %muid, "module active");
        Ok(muid)
    }

    /// Unload one module: call its exit point with the same capability
    /// table it received at init, sweep every route it owns, close the
    /// library.
    ///
    /// Also accepts records whose init failed but whose library is still
    /// open. A close failure is reported, but the module is gone from the
    /// routing perspective either way.
    pub fn unload(&self, muid: Muid) -> Result<()> {
        let cell = self
            .records
            .read()
            .get(&muid)
            .cloned()
            .ok_or(LoadError::UnknownModule(muid))?;
        let mut rec = cell.lock();

        let Some(handle) = rec.handle.take() else {
            // Nothing open: either never got that far or already unloaded.
            self.registry.sweep(muid);
            self.by_path.lock().retain(|_, m| *m != muid);
            if rec.state != ModuleState::Failed {
                rec.state = ModuleState::Unloaded;
            }
            return Ok(());
        };

        rec.state = ModuleState::Unloading;
        rec.last_error = ErrorKind::Success;
        tracing::info!(muid = %muid, path = %rec.path().display(), "unloading module");

        // rec.capabilities is always Some once a handle survived init.
        if let Some(caps) = rec.capabilities.as_ref() {
            match unsafe { handle.resolve::<ModuleUninitFn>(UNINIT_SYMBOL) } {
                Ok(uninit) => unsafe { uninit(caps.table_ptr()) },
                Err(message) => {
                    rec.last_error = ErrorKind::NoValidUninitFunc;
                    tracing::debug!(muid = %muid, %message, "module has no exit symbol");
                }
            }
        }

        let swept = self.registry.sweep(muid);
        if swept > 0 {
            tracing::debug!(muid = %muid, swept, "removed routes left behind by module");
        }
        self.by_path.lock().retain(|_, m| *m != muid);

        let close_result = handle.close();
        rec.capabilities = None;
        match close_result {
            Ok(()) => {
                rec.state = ModuleState::Unloaded;
                tracing::info!(muid = %muid, "module unloaded");
                Ok(())
            }
            Err(e) => {
                rec.fail(ErrorKind::CloseFailed);
                tracing::error!(muid = %muid, error = %e, "failed to close module library");
                Err(e)
            }
        }
    }

    /// Unload whatever record currently maps to `path` (if any), then load
    /// the file fresh under a new identity.
    pub fn reload(&self, path: &Path) -> Result<Muid> {
        if let Some(muid) = self.muid_for_path(path) {
            if let Err(e) = self.unload(muid) {
                tracing::warn!(path = %path.display(), error = %e, "unload before reload failed");
            }
        }
        self.load(path)
    }

    /// Unload the module loaded from `path`, when one is tracked.
    pub fn remove(&self, path: &Path) -> Result<Option<Muid>> {
        match self.muid_for_path(path) {
            Some(muid) => {
                self.unload(muid)?;
                Ok(Some(muid))
            }
            None => Ok(None),
        }
    }

    pub fn muid_for_path(&self, path: &Path) -> Option<Muid> {
        self.by_path.lock().get(&path_key(path)).copied()
    }

    pub fn state(&self, muid: Muid) -> Option<ModuleState> {
        self.with_record(muid, |rec| rec.state())
    }

    /// Per-identity error register: the kind recorded by the most recent
    /// lifecycle operation on this module. Only meaningful immediately
    /// after the operation it describes.
    pub fn last_error(&self, muid: Muid) -> Option<ErrorKind> {
        self.with_record(muid, |rec| rec.last_error())
    }

    pub fn declared_version(&self, muid: Muid) -> Option<u32> {
        self.with_record(muid, |rec| rec.declared_version())
            .flatten()
    }

    /// Identities currently in the `Active` state.
    pub fn active(&self) -> Vec<Muid> {
        self.records
            .read()
            .values()
            .filter(|cell| cell.lock().state() == ModuleState::Active)
            .map(|cell| cell.lock().muid())
            .collect()
    }

    fn with_record<T>(&self, muid: Muid, f: impl FnOnce(&ModuleRecord) -> T) -> Option<T> {
        let cell = self.records.read().get(&muid).cloned()?;
        let rec = cell.lock();
        Some(f(&rec))
    }
}

/// Key used to correlate filesystem paths across load/reload/remove.
/// Canonicalized so watcher events and administrative calls agree; once
/// the file is gone, the parent directory is canonicalized instead so a
/// remove event still finds the record of the deleted file.
fn path_key(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::test_support::RecordingSink;
    use std::io::Write;

    fn manager() -> ModuleManager {
        ModuleManager::new(Arc::new(RecordingSink::default()))
    }

    #[test]
    fn loading_missing_path_fails_with_no_such_module() {
        let mgr = manager();
        let path = Path::new("/definitely/not/here/libx.so");
        let err = mgr.load(path).unwrap_err();
        assert!(matches!(err, LoadError::NoSuchModule { .. }));

        let muid = mgr.muid_for_path(path).unwrap();
        assert_eq!(mgr.state(muid), Some(ModuleState::Failed));
        assert_eq!(mgr.last_error(muid), Some(ErrorKind::NoSuchModule));
        assert!(mgr.registry().is_empty());
    }

    #[test]
    fn loading_junk_file_fails_and_registers_nothing() {
        let mgr = manager();
        let mut file = tempfile::NamedTempFile::with_suffix(".so").unwrap();
        file.write_all(b"\x00\x01not an object").unwrap();

        let err = mgr.load(file.path()).unwrap_err();
        assert!(matches!(err, LoadError::NoSuchModule { .. }));
        assert!(mgr.registry().is_empty());
        assert!(mgr.active().is_empty());
    }

    #[test]
    fn unload_of_unknown_identity_errors() {
        let mgr = manager();
        let err = mgr.unload(Muid::from_raw(12345)).unwrap_err();
        assert!(matches!(err, LoadError::UnknownModule(_)));
    }

    #[test]
    fn unload_after_failed_load_is_accepted() {
        let mgr = manager();
        let path = Path::new("/definitely/not/here/liby.so");
        let _ = mgr.load(path).unwrap_err();
        let muid = mgr.muid_for_path(path).unwrap();

        // No handle was ever opened; unload just settles the record.
        mgr.unload(muid).unwrap();
        assert_eq!(mgr.state(muid), Some(ModuleState::Failed));
        assert!(mgr.muid_for_path(path).is_none());
    }

    #[test]
    fn mirror_manager_stages_and_keys_by_source_path() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = dir.path().join("mirror");
        let mgr =
            ModuleManager::with_mirror(Arc::new(RecordingSink::default()), mirror.clone());

        let src = dir.path().join("libjunk.so");
        std::fs::write(&src, b"not a real library").unwrap();
        let err = mgr.load(&src).unwrap_err();
        assert!(matches!(err, LoadError::NoSuchModule { .. }));

        // The copy landed in the mirror, and the record answers to the
        // source path, not the staged one.
        let staged = mirror.join("libjunk.so");
        assert_eq!(std::fs::read(&staged).unwrap(), b"not a real library");
        let muid = mgr.muid_for_path(&src).unwrap();
        assert_eq!(mgr.state(muid), Some(ModuleState::Failed));
        assert!(mgr.is_staged(&staged));
        assert!(!mgr.is_staged(&src));
    }

    #[test]
    fn remove_of_untracked_path_is_a_no_op() {
        let mgr = manager();
        assert_eq!(mgr.remove(Path::new("/tmp/never-loaded.so")).unwrap(), None);
    }
}
