//! Fixture library for the loader's integration tests: a real shared
//! object that declares its revision but exports no entry point, so a load
//! attempt must fail at symbol resolution.

use modbridge_abi::ABI_VERSION;

#[no_mangle]
pub extern "C" fn module_version() -> u32 {
    ABI_VERSION
}
