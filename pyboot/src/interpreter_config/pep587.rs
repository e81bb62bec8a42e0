// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interpreter configuration through the legacy (PEP 587 style) init
//! protocol.
//!
//! The embedder allocates the config structure itself, so all writes go
//! through the per-version layout descriptor; string and string-list
//! fields are set with the runtime's own helper functions so that the
//! runtime owns the memory it later clears.

use {
    super::{module_search_paths, pep587_layouts::PyConfigLayout},
    crate::{
        context::ProcessContext,
        conversion,
        dylib::{DylibPython, InitApi, LegacyInitApi, PyConfig, PyStatus, PyWideStringList},
        error::{BootloaderError, Result},
        options::RuntimeOptions,
    },
    libc::{c_int, c_ulong, wchar_t},
    std::{ffi::OsStr, path::Path},
};

/// An owned legacy config structure, sized and addressed through the
/// layout descriptor for the runtime's version.
pub struct LegacyConfig<'py> {
    dylib: &'py DylibPython,
    api: &'py LegacyInitApi,
    layout: &'static PyConfigLayout,
    // Zero-initialized backing storage; u64 units keep the maximum
    // alignment any config field requires.
    buffer: Box<[u64]>,
}

impl<'py> LegacyConfig<'py> {
    /// Allocate the config structure for the loaded runtime and fill it
    /// with the isolated-configuration defaults. Fails with an
    /// unsupported-version error when no layout is known, before any
    /// interpreter call is made.
    pub fn new(dylib: &'py DylibPython, gil_disabled: bool) -> Result<Self> {
        let api = match &dylib.init_api {
            InitApi::Legacy(api) => api,
            InitApi::Stable(_) => {
                return Err(BootloaderError::ConfigFailure {
                    context: "legacy configuration",
                    reason: "runtime uses the new init protocol".to_string(),
                })
            }
        };

        let layout = super::pep587_layouts::select_layout(dylib.version, gil_disabled)
            .ok_or(BootloaderError::UnsupportedPythonVersion {
            major: dylib.version_major(),
            minor: dylib.version_minor(),
        })?;

        let words = layout.size.div_ceil(std::mem::size_of::<u64>());
        let mut config = Self {
            dylib,
            api,
            layout,
            buffer: vec![0u64; words].into_boxed_slice(),
        };

        unsafe { (api.py_config_init_isolated_config)(config.as_mut_ptr()) };

        Ok(config)
    }

    pub fn as_mut_ptr(&mut self) -> *mut PyConfig {
        self.buffer.as_mut_ptr() as *mut PyConfig
    }

    unsafe fn field_ptr<T>(&mut self, offset: usize) -> *mut T {
        debug_assert!(offset + std::mem::size_of::<T>() <= self.layout.size);
        (self.buffer.as_mut_ptr() as *mut u8).add(offset) as *mut T
    }

    unsafe fn write_int(&mut self, offset: usize, value: c_int) {
        *self.field_ptr::<c_int>(offset) = value;
    }

    fn check(&self, status: PyStatus, context: &'static str) -> Result<()> {
        if unsafe { (self.dylib.common.py_status_exception)(status) } != 0 {
            Err(BootloaderError::ConfigFailure {
                context,
                reason: self.dylib.describe_status(&status),
            })
        } else {
            Ok(())
        }
    }

    /// Set a string field. On Windows the UTF-8 input is converted to
    /// wide chars and stored directly; elsewhere the runtime decodes the
    /// native bytes itself, honoring the pre-initialized locale.
    fn set_string(&mut self, offset: usize, value: &OsStr, context: &'static str) -> Result<()> {
        #[cfg(windows)]
        {
            let text = value
                .to_str()
                .ok_or_else(|| BootloaderError::ConfigFailure {
                    context,
                    reason: format!("{:?} is not valid Unicode", value),
                })?;
            let wide = conversion::str_to_wide(text);
            let status = unsafe {
                let config = self.as_mut_ptr();
                let field = self.field_ptr::<*mut wchar_t>(offset);
                (self.api.py_config_set_string)(config, field, wide.as_ptr())
            };
            self.check(status, context)
        }

        #[cfg(not(windows))]
        {
            let native = conversion::osstr_to_cstring(value)?;
            let status = unsafe {
                let config = self.as_mut_ptr();
                let field = self.field_ptr::<*mut wchar_t>(offset);
                (self.api.py_config_set_bytes_string)(config, field, native.as_ptr())
            };
            self.check(status, context)
        }
    }

    /// Set a wide-string-list field from native strings, converting each
    /// element with `Py_DecodeLocale` (POSIX) or directly (Windows).
    fn set_string_list(
        &mut self,
        offset: usize,
        values: &[&OsStr],
        context: &'static str,
    ) -> Result<()> {
        let mut decoded = DecodedWideList::new(self.dylib);
        for value in values {
            decoded.push(value, context)?;
        }

        let mut items = decoded.item_pointers();
        let status = unsafe {
            let config = self.as_mut_ptr();
            let field = self.field_ptr::<PyWideStringList>(offset);
            (self.api.py_config_set_wide_string_list)(
                config,
                field,
                items.len(),
                items.as_mut_ptr(),
            )
        };
        self.check(status, context)
    }

    /// Set a wide-string-list field from already-wide strings (the W/X
    /// flag lists collected by the options parser).
    fn set_wide_list(
        &mut self,
        offset: usize,
        values: &[Vec<wchar_t>],
        context: &'static str,
    ) -> Result<()> {
        let mut items: Vec<*mut wchar_t> =
            values.iter().map(|v| v.as_ptr() as *mut wchar_t).collect();

        let status = unsafe {
            let config = self.as_mut_ptr();
            let field = self.field_ptr::<PyWideStringList>(offset);
            (self.api.py_config_set_wide_string_list)(
                config,
                field,
                items.len(),
                items.as_mut_ptr(),
            )
        };
        self.check(status, context)
    }

    /// Program name; used for `sys.executable` and early error output.
    pub fn set_program_name(&mut self, ctx: &ProcessContext) -> Result<()> {
        self.set_string(
            self.layout.program_name,
            ctx.executable.as_os_str(),
            "setting program name",
        )
    }

    /// Python home; anchors `sys.prefix` at the application root.
    pub fn set_python_home(&mut self, ctx: &ProcessContext) -> Result<()> {
        self.set_string(
            self.layout.home,
            ctx.application_home.as_os_str(),
            "setting python home",
        )
    }

    /// The three fixed module search paths, with the "paths were set"
    /// flag forced so the runtime does not reconstruct `sys.path`.
    pub fn set_module_search_paths(&mut self, home: &Path) -> Result<()> {
        let paths = module_search_paths(
            home,
            self.dylib.version_major(),
            self.dylib.version_minor(),
        );
        let values: Vec<&OsStr> = paths.iter().map(|p| p.as_os_str()).collect();

        self.set_string_list(
            self.layout.module_search_paths,
            &values,
            "setting module search paths",
        )?;

        unsafe {
            let offset = self.layout.module_search_paths_set;
            self.write_int(offset, 1);
        }
        Ok(())
    }

    /// `sys.argv`, from the rewritten arguments when present.
    pub fn set_argv(&mut self, ctx: &ProcessContext) -> Result<()> {
        let argv: Vec<&OsStr> = ctx.effective_argv().iter().map(|a| a.as_os_str()).collect();
        self.set_string_list(self.layout.argv, &argv, "setting sys.argv")
    }

    /// Apply the runtime options record on top of the isolated-config
    /// defaults.
    pub fn set_runtime_options(&mut self, options: &RuntimeOptions) -> Result<()> {
        let layout = self.layout;

        unsafe {
            // The isolated configuration leaves site import and bytecode
            // writing enabled; a frozen application wants neither.
            self.write_int(layout.site_import, 0);
            self.write_int(layout.write_bytecode, 0);
            // Let the runtime configure the C stdio streams (binary
            // mode, unbuffered mode, ...).
            self.write_int(layout.configure_c_stdio, 1);

            self.write_int(layout.optimization_level, options.optimize);
            self.write_int(layout.buffered_stdio, i32::from(!options.unbuffered));
            self.write_int(layout.verbose, options.verbose);

            self.write_int(layout.use_hash_seed, i32::from(options.use_hash_seed));
            *self.field_ptr::<c_ulong>(layout.hash_seed) = options.hash_seed;

            // Already applied during pre-initialization, but the main
            // config carries its own copy of the flag.
            self.write_int(layout.dev_mode, options.dev_mode);

            // Interpreter signal handlers have always been installed by
            // this bootloader's predecessors; user code depends on it.
            self.write_int(layout.install_signal_handlers, 1);
        }

        if !options.wflags_w.is_empty() {
            self.set_wide_list(layout.warnoptions, &options.wflags_w, "setting warnoptions")?;
        }
        if !options.xflags_w.is_empty() {
            self.set_wide_list(layout.xoptions, &options.xflags_w, "setting xoptions")?;
        }

        Ok(())
    }
}

impl LegacyConfig<'_> {
    /// Start the interpreter from this configuration.
    ///
    /// On failure the runtime's own status reporting is given the final
    /// word: `Py_ExitStatusException` prints the failure details and
    /// terminates the process with the appropriate code.
    pub fn initialize(&mut self) -> Result<()> {
        let status = unsafe { (self.api.py_initialize_from_config)(self.as_mut_ptr()) };

        if unsafe { (self.dylib.common.py_status_exception)(status) } != 0 {
            // Depending on the error type this ends in exit() or
            // abort(); on Windows, keep abort() from popping up the
            // error-reporting dialog.
            #[cfg(windows)]
            unsafe {
                winapi::um::errhandlingapi::SetErrorMode(
                    winapi::um::winbase::SEM_FAILCRITICALERRORS
                        | winapi::um::winbase::SEM_NOGPFAULTERRORBOX,
                );
            }

            unsafe { (self.api.py_exit_status_exception)(status) };

            // Not reached; Py_ExitStatusException does not return.
            return Err(BootloaderError::ConfigFailure {
                context: "starting interpreter",
                reason: self.dylib.describe_status(&status),
            });
        }

        Ok(())
    }
}

impl Drop for LegacyConfig<'_> {
    fn drop(&mut self) {
        unsafe { (self.api.py_config_clear)(self.as_mut_ptr()) };
    }
}

/// Wide strings produced for a string-list field, with their storage:
/// on POSIX each element is decoded by the runtime (`Py_DecodeLocale`)
/// and must be released with `PyMem_RawFree`; on Windows the elements
/// are host-allocated vectors.
struct DecodedWideList<'py> {
    dylib: &'py DylibPython,
    #[cfg(not(windows))]
    runtime_owned: Vec<*mut wchar_t>,
    #[cfg(windows)]
    host_owned: Vec<Vec<wchar_t>>,
}

impl<'py> DecodedWideList<'py> {
    fn new(dylib: &'py DylibPython) -> Self {
        Self {
            dylib,
            #[cfg(not(windows))]
            runtime_owned: Vec::new(),
            #[cfg(windows)]
            host_owned: Vec::new(),
        }
    }

    #[cfg(not(windows))]
    fn push(&mut self, value: &OsStr, context: &'static str) -> Result<()> {
        let native = conversion::osstr_to_cstring(value)?;
        let wide = unsafe {
            (self.dylib.common.py_decode_locale)(native.as_ptr(), std::ptr::null_mut())
        };
        if wide.is_null() {
            return Err(BootloaderError::ConfigFailure {
                context,
                reason: format!("could not decode {:?}", value),
            });
        }
        self.runtime_owned.push(wide);
        Ok(())
    }

    #[cfg(windows)]
    fn push(&mut self, value: &OsStr, context: &'static str) -> Result<()> {
        let text = value
            .to_str()
            .ok_or_else(|| BootloaderError::ConfigFailure {
                context,
                reason: format!("{:?} is not valid Unicode", value),
            })?;
        self.host_owned.push(conversion::str_to_wide(text));
        Ok(())
    }

    fn item_pointers(&mut self) -> Vec<*mut wchar_t> {
        #[cfg(not(windows))]
        {
            self.runtime_owned.clone()
        }

        #[cfg(windows)]
        {
            self.host_owned
                .iter()
                .map(|v| v.as_ptr() as *mut wchar_t)
                .collect()
        }
    }
}

#[cfg(not(windows))]
impl Drop for DecodedWideList<'_> {
    fn drop(&mut self) {
        for &item in &self.runtime_owned {
            unsafe { (self.dylib.common.py_mem_raw_free)(item as *mut _) };
        }
    }
}
