//! Module records and the lifecycle state machine.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::capability::ModuleCapabilities;
use crate::error::ErrorKind;
use crate::muid::Muid;
use crate::platform::ModuleHandle;

/// Lifecycle state of one load attempt.
///
/// `Failed` and `Unloaded` are terminal for the attempt; loading the same
/// file again creates a fresh record under a fresh identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Loading,
    Active,
    Unloading,
    Unloaded,
    Failed,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleState::Loading => "loading",
            ModuleState::Active => "active",
            ModuleState::Unloading => "unloading",
            ModuleState::Unloaded => "unloaded",
            ModuleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Everything the host tracks for one loaded module instance.
pub struct ModuleRecord {
    muid: Muid,
    path: PathBuf,
    pub(crate) handle: Option<ModuleHandle>,
    pub(crate) capabilities: Option<ModuleCapabilities>,
    pub(crate) declared_version: Option<u32>,
    pub(crate) state: ModuleState,
    pub(crate) last_error: ErrorKind,
    loaded_at: DateTime<Utc>,
}

impl ModuleRecord {
    pub(crate) fn new(muid: Muid, path: &Path) -> Self {
        Self {
            muid,
            path: path.to_path_buf(),
            handle: None,
            capabilities: None,
            declared_version: None,
            state: ModuleState::Loading,
            last_error: ErrorKind::Success,
            loaded_at: Utc::now(),
        }
    }

    /// Transition to `Failed` and record the error kind.
    pub(crate) fn fail(&mut self, kind: ErrorKind) {
        self.state = ModuleState::Failed;
        self.last_error = kind;
    }

    pub fn muid(&self) -> Muid {
        self.muid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    /// Most recent error kind observed by a lifecycle operation on this
    /// record. Only meaningful immediately after the operation it
    /// describes.
    pub fn last_error(&self) -> ErrorKind {
        self.last_error
    }

    /// ABI revision the module declared at load, when it exported one.
    pub fn declared_version(&self) -> Option<u32> {
        self.declared_version
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_record_is_loading() {
        let rec = ModuleRecord::new(Muid::from_raw(1), Path::new("/tmp/a.so"));
        assert_eq!(rec.state(), ModuleState::Loading);
        assert_eq!(rec.last_error(), ErrorKind::Success);
        assert!(rec.declared_version().is_none());
    }

    #[test]
    fn fail_records_kind_and_state() {
        let mut rec = ModuleRecord::new(Muid::from_raw(1), Path::new("/tmp/a.so"));
        rec.fail(ErrorKind::NoSuchModule);
        assert_eq!(rec.state(), ModuleState::Failed);
        assert_eq!(rec.last_error(), ErrorKind::NoSuchModule);
    }
}
