//! Error taxonomy for loader and registry operations.

use std::path::PathBuf;

use crate::muid::Muid;

/// Result type for loader operations.
pub type Result<T> = std::result::Result<T, LoadError>;

/// Closed set of outcomes a module lifecycle operation can record.
///
/// This is the per-module last-error register: every load/unload step writes
/// the kind it observed into the owning [`ModuleRecord`](crate::module::ModuleRecord).
/// The value describes the most recent operation only — it is not stable
/// across a later, unrelated lifecycle call on the same record, so callers
/// that need it must query immediately after the operation.
///
/// `InitStructNull` belongs to the legacy descriptor-returning init contract
/// and is never produced by the boolean-flag contract this loader speaks; it
/// is kept so the register can represent every revision's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Success,
    UnsupportedPlatform,
    NoSuchModule,
    CloseFailed,
    NoValidInitFunc,
    NoValidUninitFunc,
    InitStructNull,
    InitFuncStateFail,
}

/// Module lifecycle error.
///
/// The variant is what host control logic branches on; the embedded message
/// carries the OS loader's own diagnostic for operators.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Dynamic loading is not available on this platform.
    #[error("unsupported platform for native modules")]
    UnsupportedPlatform,

    /// The path did not resolve to a loadable native library.
    #[error("invalid module path {path:?}: {message}")]
    NoSuchModule { path: PathBuf, message: String },

    /// The OS refused to close the library handle.
    #[error("failed to close module library: {message}")]
    CloseFailed { message: String },

    /// The entry symbol could not be resolved.
    #[error("error resolving module entry symbol: {message}")]
    NoValidInitFunc { message: String },

    /// The exit symbol could not be resolved.
    #[error("error resolving module exit symbol: {message}")]
    NoValidUninitFunc { message: String },

    /// Legacy descriptor-returning init handed back a null descriptor.
    #[error("module init descriptor was null")]
    InitStructNull,

    /// The module's init reported failure.
    #[error("module init reported failure")]
    InitFuncStateFail,

    /// No module record exists for the given identity.
    #[error("no module loaded with identity {0}")]
    UnknownModule(Muid),

    /// The identity allocator could not produce a fresh value.
    #[error("could not allocate a unique module identity")]
    IdentityExhausted,
}

/// Route registry bridge error.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// The targeted route slot belongs to another module.
    #[error("route {path:?} is owned by module {owner}")]
    NotOwner { path: String, owner: Muid },

    /// No registered route matched the given path and mask.
    #[error("no route registered for {path:?}")]
    NotFound { path: String },

    /// The method mask selects no valid verb bit.
    #[error("method mask selects no valid HTTP verb")]
    InvalidMask,
}

impl RouteError {
    /// Status code reported to modules over the FFI boundary.
    pub fn status(&self) -> u64 {
        use modbridge_abi::status::*;
        match self {
            RouteError::NotOwner { .. } => STATUS_NOT_OWNER,
            RouteError::NotFound { .. } => STATUS_NOT_FOUND,
            RouteError::InvalidMask => STATUS_INVALID_ARGUMENT,
        }
    }
}
