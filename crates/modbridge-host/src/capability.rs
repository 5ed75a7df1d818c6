//! Capability table construction.
//!
//! Each loaded module receives one [`HostApi`] table stamped with its
//! identity. The table's function entries are trampolines that recover the
//! caller's identity from the host-owned context block behind `host_data`,
//! so a module never passes (and cannot forge) an identity itself. The
//! same table is handed to `init` and later to `uninit`, which is what
//! keeps one module's unload from touching another module's routes.

use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::sync::Arc;

use modbridge_abi::{status, HostApi, HttpHandlerFn, ABI_VERSION};

use crate::logging::{LogSink, Severity};
use crate::muid::Muid;
use crate::registry::{MethodMask, RouteRegistry};

/// Host-side context backing one module's capability table.
struct CapabilityContext {
    muid: Muid,
    registry: Arc<RouteRegistry>,
    sink: Arc<dyn LogSink>,
}

/// A module's capability table plus the context block it points into.
///
/// Both boxes stay at fixed addresses for the life of this value, so the
/// raw pointer handed to the module remains valid from `init` until
/// `uninit` returns. Owned by the module's record; dropped only after the
/// library is closed.
pub struct ModuleCapabilities {
    table: Box<HostApi>,
    _ctx: Box<CapabilityContext>,
}

// The table's raw pointers reference the context box owned by this same
// value; the context itself is only Arcs and a Muid.
unsafe impl Send for ModuleCapabilities {}
unsafe impl Sync for ModuleCapabilities {}

impl ModuleCapabilities {
    /// Pointer passed to the module's entry and exit functions.
    pub fn table_ptr(&self) -> *const HostApi {
        &*self.table
    }

    pub fn muid(&self) -> Muid {
        Muid::from_raw(self.table.muid)
    }
}

/// Builds identity-scoped capability tables.
pub struct CapabilityBuilder {
    registry: Arc<RouteRegistry>,
    sink: Arc<dyn LogSink>,
}

impl CapabilityBuilder {
    pub fn new(registry: Arc<RouteRegistry>, sink: Arc<dyn LogSink>) -> Self {
        Self { registry, sink }
    }

    /// Construct the table for one module identity. Pure construction: no
    /// I/O and no failure mode.
    pub fn build(&self, muid: Muid) -> ModuleCapabilities {
        let ctx = Box::new(CapabilityContext {
            muid,
            registry: self.registry.clone(),
            sink: self.sink.clone(),
        });
        let table = Box::new(HostApi {
            abi_version: ABI_VERSION,
            muid: muid.as_u64(),
            log_info: log_info_entry,
            log_warn: log_warn_entry,
            log_error: log_error_entry,
            log_fatal: log_fatal_entry,
            register_http: register_http_entry,
            unregister_http: unregister_http_entry,
            host_data: &*ctx as *const CapabilityContext as *const c_void,
        });
        ModuleCapabilities { table, _ctx: ctx }
    }
}

/// Recover the context block from a table pointer handed back by a module.
unsafe fn context<'a>(api: *const HostApi) -> Option<&'a CapabilityContext> {
    if api.is_null() {
        return None;
    }
    ((*api).host_data as *const CapabilityContext).as_ref()
}

/// Lossily decode a module-supplied C string; null yields `None`.
unsafe fn decode(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
}

unsafe fn log_entry(api: *const HostApi, severity: Severity, msg: *const c_char, tag: *const c_char) {
    let Some(ctx) = context(api) else { return };
    let Some(msg) = decode(msg) else { return };
    let tag = decode(tag).unwrap_or_default();
    // Module sources habitually end messages with a newline.
    ctx.sink.log(severity, ctx.muid, msg.trim_end(), &tag);
}

unsafe extern "C" fn log_info_entry(api: *const HostApi, msg: *const c_char, tag: *const c_char) {
    log_entry(api, Severity::Info, msg, tag)
}

unsafe extern "C" fn log_warn_entry(api: *const HostApi, msg: *const c_char, tag: *const c_char) {
    log_entry(api, Severity::Warn, msg, tag)
}

unsafe extern "C" fn log_error_entry(api: *const HostApi, msg: *const c_char, tag: *const c_char) {
    log_entry(api, Severity::Error, msg, tag)
}

unsafe extern "C" fn log_fatal_entry(api: *const HostApi, msg: *const c_char, tag: *const c_char) {
    log_entry(api, Severity::Fatal, msg, tag)
}

unsafe extern "C" fn register_http_entry(
    api: *const HostApi,
    method_mask: u8,
    path: *const c_char,
    handler: Option<HttpHandlerFn>,
    extra: *mut c_void,
) -> u64 {
    let Some(ctx) = context(api) else {
        return status::STATUS_BAD_IDENTITY;
    };
    let Some(handler) = handler else {
        return status::STATUS_INVALID_ARGUMENT;
    };
    if path.is_null() {
        return status::STATUS_INVALID_ARGUMENT;
    }
    let path = match CStr::from_ptr(path).to_str() {
        Ok(p) => p,
        Err(_) => return status::STATUS_INVALID_ARGUMENT,
    };
    match ctx
        .registry
        .register(ctx.muid, MethodMask::from_bits(method_mask), path, handler, extra)
    {
        Ok(()) => status::STATUS_OK,
        Err(e) => {
            tracing::warn!(muid = %ctx.muid, path, error = %e, "module route registration refused");
            e.status()
        }
    }
}

unsafe extern "C" fn unregister_http_entry(
    api: *const HostApi,
    method_mask: u8,
    path: *const c_char,
) -> u64 {
    let Some(ctx) = context(api) else {
        return status::STATUS_BAD_IDENTITY;
    };
    if path.is_null() {
        return status::STATUS_INVALID_ARGUMENT;
    }
    let path = match CStr::from_ptr(path).to_str() {
        Ok(p) => p,
        Err(_) => return status::STATUS_INVALID_ARGUMENT,
    };
    match ctx
        .registry
        .unregister(ctx.muid, MethodMask::from_bits(method_mask), path)
    {
        Ok(_) => status::STATUS_OK,
        Err(e) => {
            tracing::warn!(muid = %ctx.muid, path, error = %e, "module route unregistration refused");
            e.status()
        }
    }
}
