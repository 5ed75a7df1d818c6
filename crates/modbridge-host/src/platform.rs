//! Platform loader: the OS dynamic-library primitives behind one interface.
//!
//! `libloading` selects the POSIX (`dlopen`/`dlsym`/`dlclose`) or Windows
//! (`LoadLibrary`/`GetProcAddress`/`FreeLibrary`) facility at build time;
//! nothing else in the host branches on platform. Error *kinds* are
//! identical across platforms — only the embedded OS message differs.

use std::path::Path;

use libloading::Library;

use crate::error::LoadError;

/// Exclusively owned handle to an open module library.
///
/// The lifecycle manager is the only owner; the handle is consumed by
/// [`ModuleHandle::close`] and cannot be used afterwards.
#[derive(Debug)]
pub struct ModuleHandle {
    lib: Library,
}

impl ModuleHandle {
    /// Resolve a symbol to a raw value (typically an `extern "C"` function
    /// pointer), copied out so it does not borrow the library.
    ///
    /// # Safety
    ///
    /// `T` must match the actual type of the exported symbol. The returned
    /// value is only valid while this handle stays open.
    pub unsafe fn resolve<T: Copy>(&self, symbol: &[u8]) -> Result<T, String> {
        self.lib
            .get::<T>(symbol)
            .map(|sym| *sym)
            .map_err(|e| e.to_string())
    }

    /// Close the library. On failure the handle is gone either way; the OS
    /// message is carried in the error.
    pub fn close(self) -> Result<(), LoadError> {
        self.lib.close().map_err(|e| LoadError::CloseFailed {
            message: e.to_string(),
        })
    }
}

/// Open a native library.
///
/// A path that exists but is not a loadable native object yields
/// [`LoadError::NoSuchModule`] with the OS loader's diagnostic, never a
/// crash.
pub fn open(path: &Path) -> Result<ModuleHandle, LoadError> {
    #[cfg(not(any(unix, windows)))]
    {
        let _ = path;
        return Err(LoadError::UnsupportedPlatform);
    }

    #[cfg(any(unix, windows))]
    unsafe {
        Library::new(path)
            .map(|lib| ModuleHandle { lib })
            .map_err(|e| LoadError::NoSuchModule {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
    }
}

/// Whether a file name looks like a loadable module for any supported OS
/// (`.so`, versioned `.so.1.2`, `.dylib`, `.dll`).
pub fn is_module_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let name = name.to_ascii_lowercase();
    if name.ends_with(".so") || name.ends_with(".dylib") || name.ends_with(".dll") {
        return true;
    }
    // Versioned shared objects: everything after ".so." must be dot-separated digits.
    if let Some(idx) = name.find(".so.") {
        let rest = &name[idx + 4..];
        return !rest.is_empty() && rest.split('.').all(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()));
    }
    false
}
