//! Smoke-test module for the loader's integration tests.
//!
//! Built as a `cdylib` by the workspace and loaded by the host's ignored
//! integration tests. Behavior is steered through environment variables so
//! one artifact can exercise several lifecycle paths:
//!
//! - `MODBRIDGE_SMOKE_FAIL` — when set, `init` logs and returns `false`.
//! - `MODBRIDGE_SMOKE_ROUTE` — route path to register (default `/smoke`).

use std::ffi::CString;
use std::os::raw::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use modbridge_abi::{method::METHOD_GET, HostApi, HostContext, HostRequest, ABI_VERSION};

static INVOCATIONS: AtomicU64 = AtomicU64::new(0);
static ROUTE: OnceLock<CString> = OnceLock::new();

fn route() -> &'static CString {
    ROUTE.get_or_init(|| {
        let path = std::env::var("MODBRIDGE_SMOKE_ROUTE").unwrap_or_else(|_| "/smoke".into());
        CString::new(path).unwrap_or_else(|_| c"/smoke".to_owned())
    })
}

unsafe extern "C" fn smoke_handler(
    _ctx: *mut HostContext,
    _req: *mut HostRequest,
    _extra: *mut c_void,
) {
    INVOCATIONS.fetch_add(1, Ordering::Relaxed);
}

/// Times the handler has run; resolvable by the host for assertions.
#[no_mangle]
pub extern "C" fn smoke_invocations() -> u64 {
    INVOCATIONS.load(Ordering::Relaxed)
}

#[no_mangle]
pub extern "C" fn module_version() -> u32 {
    ABI_VERSION
}

/// Module entry point.
///
/// # Safety
///
/// `api` must point to a live capability table handed over by the loader.
#[no_mangle]
pub unsafe extern "C" fn init(api: *const HostApi) -> bool {
    let Some(table) = api.as_ref() else {
        return false;
    };

    if std::env::var_os("MODBRIDGE_SMOKE_FAIL").is_some() {
        (table.log_error)(
            api,
            c"refusing to initialize: poison switch is set".as_ptr(),
            c"smoke:init".as_ptr(),
        );
        return false;
    }

    let rc = (table.register_http)(
        api,
        METHOD_GET,
        route().as_ptr(),
        Some(smoke_handler),
        std::ptr::null_mut(),
    );
    if rc != modbridge_abi::status::STATUS_OK {
        (table.log_error)(
            api,
            c"route registration failed".as_ptr(),
            c"smoke:init".as_ptr(),
        );
        return false;
    }

    (table.log_info)(
        api,
        c"smoke module initialized".as_ptr(),
        c"smoke:init".as_ptr(),
    );
    true
}

/// Module exit point. Unregisters the route; the loader sweeps whatever a
/// module forgets, but this module cleans up after itself.
///
/// # Safety
///
/// `api` must be the same capability table that was passed to `init`.
#[no_mangle]
pub unsafe extern "C" fn uninit(api: *const HostApi) {
    let Some(table) = api.as_ref() else {
        return;
    };
    let _ = (table.unregister_http)(api, METHOD_GET, route().as_ptr());
    (table.log_info)(
        api,
        c"smoke module shutting down".as_ptr(),
        c"smoke:uninit".as_ptr(),
    );
}
