//! C ABI shared between the modbridge host and its dynamically loaded modules.
//!
//! A module is an ordinary native shared library (`.so`, `.dylib`, `.dll`)
//! exporting an [`INIT_SYMBOL`] entry point. At load time the host hands the
//! module a [`HostApi`] capability table; everything the module may do —
//! logging, registering and unregistering HTTP routes — goes through that
//! table. Every capability call passes the table pointer back as its first
//! argument, so the host recovers the caller's identity from memory it owns
//! and a module never names (and cannot forge) an identity explicitly.
//!
//! ## ABI revisions
//!
//! The canonical entry contract is the boolean-flag form: `init` returns
//! `true` on success. Revisions 1–3 instead returned a pointer to a
//! version-stamped descriptor struct; that form is no longer supported by
//! the loader and is documented here only so old module sources can be
//! recognized. A module may export the optional [`MODULE_VERSION_SYMBOL`]
//! to declare which revision it was built against.

use std::os::raw::{c_char, c_void};

/// Interface revision implemented by the loader.
pub const ABI_VERSION: u32 = 4;

/// Entry symbol every module must export: `extern "C" fn(*const HostApi) -> bool`.
pub const INIT_SYMBOL: &[u8] = b"init\0";

/// Optional exit symbol: `extern "C" fn(*const HostApi)`.
pub const UNINIT_SYMBOL: &[u8] = b"uninit\0";

/// Optional version symbol: `extern "C" fn() -> u32`. Absent means "current".
pub const MODULE_VERSION_SYMBOL: &[u8] = b"module_version\0";

/// Opaque per-request connection context owned by the host's HTTP engine.
#[repr(C)]
pub struct HostContext {
    _private: [u8; 0],
}

/// Opaque parsed-request handle owned by the host's HTTP engine.
#[repr(C)]
pub struct HostRequest {
    _private: [u8; 0],
}

/// HTTP handler implemented by a module.
///
/// `extra` is the opaque pointer the module supplied at registration,
/// passed through unmodified on every invocation.
pub type HttpHandlerFn =
    unsafe extern "C" fn(ctx: *mut HostContext, req: *mut HostRequest, extra: *mut c_void);

/// Logging capability entry. `tag` is a caller-supplied source location
/// (`file:line` or similar) used for traceability.
pub type LogFn = unsafe extern "C" fn(api: *const HostApi, msg: *const c_char, tag: *const c_char);

/// Route registration capability entry. Returns a [`status`] code.
pub type RegisterHttpFn = unsafe extern "C" fn(
    api: *const HostApi,
    method_mask: u8,
    path: *const c_char,
    handler: Option<HttpHandlerFn>,
    extra: *mut c_void,
) -> u64;

/// Route unregistration capability entry. Returns a [`status`] code.
pub type UnregisterHttpFn =
    unsafe extern "C" fn(api: *const HostApi, method_mask: u8, path: *const c_char) -> u64;

/// Module entry point (boolean-flag form, current revision).
pub type ModuleInitFn = unsafe extern "C" fn(api: *const HostApi) -> bool;

/// Module exit point.
pub type ModuleUninitFn = unsafe extern "C" fn(api: *const HostApi);

/// Module ABI revision query.
pub type ModuleVersionFn = unsafe extern "C" fn() -> u32;

/// Capability table handed to a module at init and again at uninit.
///
/// Constructed once per loaded module, stamped with that module's identity,
/// and immutable afterwards. The table stays valid from `init` until the
/// module's `uninit` returns; modules must not retain the pointer past that.
/// `host_data` belongs to the host and is meaningless to modules.
#[repr(C)]
pub struct HostApi {
    /// Loader interface revision ([`ABI_VERSION`]).
    pub abi_version: u32,
    /// Identity assigned to this module instance. Read-only.
    pub muid: u64,
    pub log_info: LogFn,
    pub log_warn: LogFn,
    pub log_error: LogFn,
    pub log_fatal: LogFn,
    pub register_http: RegisterHttpFn,
    pub unregister_http: UnregisterHttpFn,
    /// Host-owned context backing the capability entries. Opaque.
    pub host_data: *const c_void,
}

/// Method mask bits. Bit 0 is reserved.
pub mod method {
    pub const METHOD_GET: u8 = 1 << 1;
    pub const METHOD_HEAD: u8 = 1 << 2;
    pub const METHOD_POST: u8 = 1 << 3;
    pub const METHOD_PUT: u8 = 1 << 4;
    pub const METHOD_DELETE: u8 = 1 << 5;
    pub const METHOD_PATCH: u8 = 1 << 6;
    pub const METHOD_OPTIONS: u8 = 1 << 7;
    /// Matches every valid verb bit.
    pub const METHOD_ANY: u8 = !0;
}

/// Status codes returned by the route capability entries.
pub mod status {
    pub const STATUS_OK: u64 = 0;
    /// The calling table did not map to a live module.
    pub const STATUS_BAD_IDENTITY: u64 = 1;
    /// The route slot is owned by another module.
    pub const STATUS_NOT_OWNER: u64 = 2;
    /// No route matched the given (path, mask).
    pub const STATUS_NOT_FOUND: u64 = 3;
    /// Null handler, null path, or a path that is not valid UTF-8.
    pub const STATUS_INVALID_ARGUMENT: u64 = 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_names_are_nul_terminated() {
        assert_eq!(INIT_SYMBOL.last(), Some(&0));
        assert_eq!(UNINIT_SYMBOL.last(), Some(&0));
        assert_eq!(MODULE_VERSION_SYMBOL.last(), Some(&0));
    }

    #[test]
    fn any_mask_covers_every_verb() {
        use method::*;
        for bit in [
            METHOD_GET,
            METHOD_HEAD,
            METHOD_POST,
            METHOD_PUT,
            METHOD_DELETE,
            METHOD_PATCH,
            METHOD_OPTIONS,
        ] {
            assert_eq!(METHOD_ANY & bit, bit);
        }
    }
}
