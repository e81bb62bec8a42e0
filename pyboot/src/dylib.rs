// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dynamic binding to the collected Python shared library.
//!
//! The bootloader must work with whatever Python version the application
//! was built against, so it never links against `Python.h`-era FFI
//! crates. Instead it loads the collected shared library at run time and
//! binds the exported functions it needs, treating Python objects as
//! opaque pointers throughout. The one place where layout knowledge is
//! unavoidable (the legacy init-config structure) lives in
//! `interpreter_config::pep587_layouts`.

use {
    crate::error::{BootloaderError, Result},
    libc::{c_char, c_int, c_void, wchar_t},
    std::{
        ffi::CString,
        path::Path,
    },
};

/// Opaque Python object.
#[repr(C)]
pub struct PyObject {
    _private: [u8; 0],
}

/// Opaque compiler-flags argument of `PyRun_SimpleStringFlags`.
#[repr(C)]
pub struct PyCompilerFlags {
    _private: [u8; 0],
}

/// Opaque legacy init-config structure; its per-version layout is
/// described by `interpreter_config::pep587_layouts`.
#[repr(C)]
pub struct PyConfig {
    _private: [u8; 0],
}

/// Opaque new-protocol init-config handle.
#[repr(C)]
pub struct PyInitConfig {
    _private: [u8; 0],
}

/// `PyStatus`, returned by value. Its layout has been stable across all
/// supported Python versions.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PyStatus {
    pub kind: c_int,
    pub func: *const c_char,
    pub err_msg: *const c_char,
    pub exitcode: c_int,
}

/// `PyWideStringList`, embedded in the legacy config structure. Layout
/// stable across supported versions. `Py_ssize_t` is mapped to `usize`:
/// only the storage width matters here, not the signedness.
#[repr(C)]
pub struct PyWideStringList {
    pub length: usize,
    pub items: *mut *mut wchar_t,
}

/// `PyPreConfig`. Layout stable across supported versions.
#[repr(C)]
pub struct PyPreConfig {
    pub _config_init: c_int,
    pub parse_argv: c_int,
    pub isolated: c_int,
    pub use_environment: c_int,
    pub configure_locale: c_int,
    pub coerce_c_locale: c_int,
    pub coerce_c_locale_warn: c_int,
    #[cfg(windows)]
    pub legacy_windows_fs_encoding: c_int,
    pub utf8_mode: c_int,
    pub dev_mode: c_int,
    pub allocator: c_int,
}

impl PyPreConfig {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

/// Symbols bound regardless of which init protocol is active.
pub struct CommonApi {
    pub py_dec_ref: unsafe extern "C" fn(*mut PyObject),
    pub py_decode_locale: unsafe extern "C" fn(*const c_char, *mut usize) -> *mut wchar_t,
    pub py_finalize: unsafe extern "C" fn(),
    pub py_is_initialized: unsafe extern "C" fn() -> c_int,
    pub py_pre_initialize: unsafe extern "C" fn(*const PyPreConfig) -> PyStatus,
    pub py_pre_config_init_isolated_config: unsafe extern "C" fn(*mut PyPreConfig),
    pub py_status_exception: unsafe extern "C" fn(PyStatus) -> c_int,

    pub py_err_clear: unsafe extern "C" fn(),
    pub py_err_fetch:
        unsafe extern "C" fn(*mut *mut PyObject, *mut *mut PyObject, *mut *mut PyObject),
    pub py_err_normalize_exception:
        unsafe extern "C" fn(*mut *mut PyObject, *mut *mut PyObject, *mut *mut PyObject),
    pub py_err_occurred: unsafe extern "C" fn() -> *mut PyObject,
    pub py_err_print: unsafe extern "C" fn(),
    pub py_err_restore: unsafe extern "C" fn(*mut PyObject, *mut PyObject, *mut PyObject),

    pub py_eval_eval_code:
        unsafe extern "C" fn(*mut PyObject, *mut PyObject, *mut PyObject) -> *mut PyObject,

    pub py_import_add_module: unsafe extern "C" fn(*const c_char) -> *mut PyObject,
    pub py_import_exec_code_module:
        unsafe extern "C" fn(*const c_char, *mut PyObject) -> *mut PyObject,
    pub py_import_import_module: unsafe extern "C" fn(*const c_char) -> *mut PyObject,

    pub py_list_append: unsafe extern "C" fn(*mut PyObject, *mut PyObject) -> c_int,

    pub py_marshal_read_object_from_string:
        unsafe extern "C" fn(*const c_char, usize) -> *mut PyObject,

    pub py_mem_raw_free: unsafe extern "C" fn(*mut c_void),

    pub py_module_get_dict: unsafe extern "C" fn(*mut PyObject) -> *mut PyObject,

    pub py_object_call_function:
        unsafe extern "C" fn(*mut PyObject, *const c_char, ...) -> *mut PyObject,
    pub py_object_call_function_obj_args:
        unsafe extern "C" fn(*mut PyObject, ...) -> *mut PyObject,
    pub py_object_get_attr_string:
        unsafe extern "C" fn(*mut PyObject, *const c_char) -> *mut PyObject,
    pub py_object_set_attr_string:
        unsafe extern "C" fn(*mut PyObject, *const c_char, *mut PyObject) -> c_int,
    pub py_object_str: unsafe extern "C" fn(*mut PyObject) -> *mut PyObject,

    pub py_run_simple_string_flags:
        unsafe extern "C" fn(*const c_char, *mut PyCompilerFlags) -> c_int,

    pub py_sys_get_object: unsafe extern "C" fn(*const c_char) -> *mut PyObject,
    pub py_sys_set_object: unsafe extern "C" fn(*const c_char, *mut PyObject) -> c_int,

    pub py_unicode_as_utf8: unsafe extern "C" fn(*mut PyObject) -> *const c_char,
    pub py_unicode_decode: unsafe extern "C" fn(
        *const c_char,
        usize,
        *const c_char,
        *const c_char,
    ) -> *mut PyObject,
    pub py_unicode_decode_fs_default: unsafe extern "C" fn(*const c_char) -> *mut PyObject,
    pub py_unicode_from_format: unsafe extern "C" fn(*const c_char, ...) -> *mut PyObject,
    pub py_unicode_from_string: unsafe extern "C" fn(*const c_char) -> *mut PyObject,
    pub py_unicode_join: unsafe extern "C" fn(*mut PyObject, *mut PyObject) -> *mut PyObject,
    pub py_unicode_replace:
        unsafe extern "C" fn(*mut PyObject, *mut PyObject, *mut PyObject, usize) -> *mut PyObject,
}

/// Symbols of the legacy (PEP 587 style) init protocol.
pub struct LegacyInitApi {
    pub py_config_clear: unsafe extern "C" fn(*mut PyConfig),
    pub py_config_init_isolated_config: unsafe extern "C" fn(*mut PyConfig),
    pub py_config_set_bytes_string:
        unsafe extern "C" fn(*mut PyConfig, *mut *mut wchar_t, *const c_char) -> PyStatus,
    pub py_config_set_string:
        unsafe extern "C" fn(*mut PyConfig, *mut *mut wchar_t, *const wchar_t) -> PyStatus,
    pub py_config_set_wide_string_list: unsafe extern "C" fn(
        *mut PyConfig,
        *mut PyWideStringList,
        usize,
        *mut *mut wchar_t,
    ) -> PyStatus,

    pub py_initialize_from_config: unsafe extern "C" fn(*mut PyConfig) -> PyStatus,
    pub py_exit_status_exception: unsafe extern "C" fn(PyStatus),
}

/// Symbols of the new (PEP 741 style) init protocol.
pub struct StableInitApi {
    pub py_init_config_create: unsafe extern "C" fn() -> *mut PyInitConfig,
    pub py_init_config_free: unsafe extern "C" fn(*mut PyInitConfig),
    pub py_init_config_set_int:
        unsafe extern "C" fn(*mut PyInitConfig, *const c_char, i64) -> c_int,
    pub py_init_config_set_str:
        unsafe extern "C" fn(*mut PyInitConfig, *const c_char, *const c_char) -> c_int,
    pub py_init_config_set_str_list: unsafe extern "C" fn(
        *mut PyInitConfig,
        *const c_char,
        usize,
        *const *const c_char,
    ) -> c_int,
    pub py_init_config_get_error:
        unsafe extern "C" fn(*mut PyInitConfig, *mut *const c_char) -> c_int,

    pub py_initialize_from_init_config: unsafe extern "C" fn(*mut PyInitConfig) -> c_int,
}

/// Exactly one protocol is bound; holding the full symbol set inside the
/// variant makes "all symbols of the active protocol are present" a
/// property of the type rather than a run-time claim.
pub enum InitApi {
    Legacy(LegacyInitApi),
    Stable(StableInitApi),
}

/// The loaded Python shared library.
///
/// Owned by the main/subprocess role only; the single-file parent never
/// loads Python, and a spawned child must load its own copy. Dropping
/// the handle unloads the library.
pub struct DylibPython {
    /// Keeps the library mapped for the lifetime of the handle;
    /// dropping it unloads the library.
    _library: SharedLibrary,
    /// Collected Python version as `100 * major + minor`.
    pub version: u16,
    pub common: CommonApi,
    pub init_api: InitApi,
    /// Bundled universal-CRT copy loaded ahead of the Python DLL; kept
    /// alive for as long as the Python library itself.
    #[cfg(windows)]
    _ucrt: Option<SharedLibrary>,
}

impl DylibPython {
    /// Load the Python shared library `libname` from the application
    /// root and bind the required symbol set.
    pub fn load(
        log: &slog::Logger,
        root_directory: &Path,
        libname: &str,
        version: u16,
    ) -> Result<Self> {
        let library_path = root_directory.join(libname);

        // On Windows, pre-load a bundled ucrtbase.dll if one was
        // collected next to the Python DLL, so that Python DLL loading
        // does not fail on systems without the universal CRT update.
        #[cfg(windows)]
        let ucrt = {
            let ucrt_path = root_directory.join("ucrtbase.dll");
            if ucrt_path.exists() {
                slog::debug!(log, "pre-loading bundled {}", ucrt_path.display());
                SharedLibrary::open(&ucrt_path).ok()
            } else {
                None
            }
        };

        slog::debug!(log, "loading Python shared library: {}", library_path.display());
        let library =
            SharedLibrary::open(&library_path).map_err(|reason| BootloaderError::DynLibLoad {
                library: library_path.clone(),
                reason,
            })?;

        let common = CommonApi {
            py_dec_ref: required(&library, "Py_DecRef")?,
            py_decode_locale: required(&library, "Py_DecodeLocale")?,
            py_finalize: required(&library, "Py_Finalize")?,
            py_is_initialized: required(&library, "Py_IsInitialized")?,
            py_pre_initialize: required(&library, "Py_PreInitialize")?,
            py_pre_config_init_isolated_config: required(
                &library,
                "PyPreConfig_InitIsolatedConfig",
            )?,
            py_status_exception: required(&library, "PyStatus_Exception")?,
            py_err_clear: required(&library, "PyErr_Clear")?,
            py_err_fetch: required(&library, "PyErr_Fetch")?,
            py_err_normalize_exception: required(&library, "PyErr_NormalizeException")?,
            py_err_occurred: required(&library, "PyErr_Occurred")?,
            py_err_print: required(&library, "PyErr_Print")?,
            py_err_restore: required(&library, "PyErr_Restore")?,
            py_eval_eval_code: required(&library, "PyEval_EvalCode")?,
            py_import_add_module: required(&library, "PyImport_AddModule")?,
            py_import_exec_code_module: required(&library, "PyImport_ExecCodeModule")?,
            py_import_import_module: required(&library, "PyImport_ImportModule")?,
            py_list_append: required(&library, "PyList_Append")?,
            py_marshal_read_object_from_string: required(
                &library,
                "PyMarshal_ReadObjectFromString",
            )?,
            py_mem_raw_free: required(&library, "PyMem_RawFree")?,
            py_module_get_dict: required(&library, "PyModule_GetDict")?,
            py_object_call_function: required(&library, "PyObject_CallFunction")?,
            py_object_call_function_obj_args: required(&library, "PyObject_CallFunctionObjArgs")?,
            py_object_get_attr_string: required(&library, "PyObject_GetAttrString")?,
            py_object_set_attr_string: required(&library, "PyObject_SetAttrString")?,
            py_object_str: required(&library, "PyObject_Str")?,
            py_run_simple_string_flags: required(&library, "PyRun_SimpleStringFlags")?,
            py_sys_get_object: required(&library, "PySys_GetObject")?,
            py_sys_set_object: required(&library, "PySys_SetObject")?,
            py_unicode_as_utf8: required(&library, "PyUnicode_AsUTF8")?,
            py_unicode_decode: required(&library, "PyUnicode_Decode")?,
            py_unicode_decode_fs_default: required(&library, "PyUnicode_DecodeFSDefault")?,
            py_unicode_from_format: required(&library, "PyUnicode_FromFormat")?,
            py_unicode_from_string: required(&library, "PyUnicode_FromString")?,
            py_unicode_join: required(&library, "PyUnicode_Join")?,
            py_unicode_replace: required(&library, "PyUnicode_Replace")?,
        };

        // Probe for PyInitConfig_Create to detect the new init protocol
        // (Python >= 3.14.0a2); fall back to the legacy protocol.
        let init_api = if !library.symbol("PyInitConfig_Create").is_null() {
            slog::debug!(log, "new-style init protocol detected");
            InitApi::Stable(StableInitApi {
                py_init_config_create: required(&library, "PyInitConfig_Create")?,
                py_init_config_free: required(&library, "PyInitConfig_Free")?,
                py_init_config_set_int: required(&library, "PyInitConfig_SetInt")?,
                py_init_config_set_str: required(&library, "PyInitConfig_SetStr")?,
                py_init_config_set_str_list: required(&library, "PyInitConfig_SetStrList")?,
                py_init_config_get_error: required(&library, "PyInitConfig_GetError")?,
                py_initialize_from_init_config: required(&library, "Py_InitializeFromInitConfig")?,
            })
        } else {
            slog::debug!(log, "legacy init protocol selected");
            InitApi::Legacy(LegacyInitApi {
                py_config_clear: required(&library, "PyConfig_Clear")?,
                py_config_init_isolated_config: required(&library, "PyConfig_InitIsolatedConfig")?,
                py_config_set_bytes_string: required(&library, "PyConfig_SetBytesString")?,
                py_config_set_string: required(&library, "PyConfig_SetString")?,
                py_config_set_wide_string_list: required(&library, "PyConfig_SetWideStringList")?,
                py_initialize_from_config: required(&library, "Py_InitializeFromConfig")?,
                py_exit_status_exception: required(&library, "Py_ExitStatusException")?,
            })
        };

        Ok(Self {
            _library: library,
            version,
            common,
            init_api,
            #[cfg(windows)]
            _ucrt: ucrt,
        })
    }

    pub fn uses_stable_init(&self) -> bool {
        matches!(self.init_api, InitApi::Stable(_))
    }

    pub fn version_major(&self) -> u16 {
        self.version / 100
    }

    pub fn version_minor(&self) -> u16 {
        self.version % 100
    }

    /// Format a `PyStatus` failure for error reporting.
    pub fn describe_status(&self, status: &PyStatus) -> String {
        unsafe {
            if !status.func.is_null() && !status.err_msg.is_null() {
                format!(
                    "{}: {}",
                    std::ffi::CStr::from_ptr(status.func).to_string_lossy(),
                    std::ffi::CStr::from_ptr(status.err_msg).to_string_lossy()
                )
            } else if !status.err_msg.is_null() {
                std::ffi::CStr::from_ptr(status.err_msg)
                    .to_string_lossy()
                    .to_string()
            } else {
                "no status details available".to_string()
            }
        }
    }
}

/// Bind a required symbol into a typed function pointer.
fn required<T: Copy>(library: &SharedLibrary, name: &'static str) -> Result<T> {
    assert_eq!(
        std::mem::size_of::<T>(),
        std::mem::size_of::<*mut c_void>()
    );

    let address = library.symbol(name);
    if address.is_null() {
        return Err(BootloaderError::SymbolMissing(name));
    }

    // An object pointer is punned into a function pointer; the two have
    // identical representation on every supported platform.
    Ok(unsafe { std::mem::transmute_copy::<*mut c_void, T>(&address) })
}

/// Minimal owned wrapper over a platform shared-library handle. Also
/// used for the Tcl/Tk libraries of the splash subsystem.
#[derive(Debug)]
pub(crate) struct SharedLibrary {
    handle: *mut c_void,
}

// The handle is a process-global resource; nothing about it is tied to
// the creating thread.
unsafe impl Send for SharedLibrary {}

impl SharedLibrary {
    #[cfg(unix)]
    pub fn open(path: &Path) -> std::result::Result<Self, String> {
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| "path contains an embedded NUL".to_string())?;

        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
        if handle.is_null() {
            return Err(dl_error());
        }

        Ok(Self { handle })
    }

    #[cfg(windows)]
    pub fn open(path: &Path) -> std::result::Result<Self, String> {
        use {std::os::windows::ffi::OsStrExt, winapi::um::libloaderapi};

        let wide: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        let handle = unsafe {
            libloaderapi::LoadLibraryExW(
                wide.as_ptr(),
                std::ptr::null_mut(),
                libloaderapi::LOAD_WITH_ALTERED_SEARCH_PATH,
            )
        };
        if handle.is_null() {
            return Err(format!(
                "LoadLibraryExW failed with error code {}",
                unsafe { winapi::um::errhandlingapi::GetLastError() }
            ));
        }

        Ok(Self {
            handle: handle as *mut c_void,
        })
    }

    /// Resolve a symbol; null when absent.
    pub fn symbol(&self, name: &str) -> *mut c_void {
        let c_name = match CString::new(name) {
            Ok(s) => s,
            Err(_) => return std::ptr::null_mut(),
        };

        #[cfg(unix)]
        unsafe {
            libc::dlsym(self.handle, c_name.as_ptr())
        }

        #[cfg(windows)]
        unsafe {
            winapi::um::libloaderapi::GetProcAddress(self.handle as *mut _, c_name.as_ptr())
                as *mut c_void
        }
    }

}

impl Drop for SharedLibrary {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            libc::dlclose(self.handle);
        }

        #[cfg(windows)]
        unsafe {
            winapi::um::libloaderapi::FreeLibrary(self.handle as *mut _);
        }
    }
}

#[cfg(unix)]
fn dl_error() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "unknown dlopen error".to_string()
    } else {
        unsafe { std::ffi::CStr::from_ptr(err) }
            .to_string_lossy()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_config_layout_is_plausible() {
        // The structure is passed to the runtime by pointer; its layout
        // must match the C ABI expectations exactly.
        let ints = if cfg!(windows) { 11 } else { 10 };
        assert_eq!(
            std::mem::size_of::<PyPreConfig>(),
            ints * std::mem::size_of::<c_int>()
        );
    }

    #[test]
    fn missing_library_reports_reason() {
        let err = SharedLibrary::open(Path::new("/nonexistent/libpython9.9.so")).unwrap_err();
        assert!(!err.is_empty());
    }
}
