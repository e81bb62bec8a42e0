// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interpreter configuration through the new (PEP 741 style) init
//! protocol.
//!
//! All fields are set by name through the runtime's own setters, so no
//! version-specific layout knowledge is needed. Strings are UTF-8: on
//! Windows our strings already are, on POSIX systems they are converted
//! from the locale encoding first.

use {
    super::module_search_paths,
    crate::{
        context::ProcessContext,
        conversion,
        dylib::{DylibPython, InitApi, PyInitConfig, StableInitApi},
        error::{BootloaderError, Result},
        options::RuntimeOptions,
    },
    std::ffi::{CStr, CString, OsStr},
    std::path::Path,
};

/// An owned new-protocol config handle.
pub struct StableConfig<'py> {
    dylib: &'py DylibPython,
    api: &'py StableInitApi,
    ptr: *mut PyInitConfig,
}

impl<'py> StableConfig<'py> {
    pub fn new(dylib: &'py DylibPython) -> Result<Self> {
        let api = match &dylib.init_api {
            InitApi::Stable(api) => api,
            InitApi::Legacy(_) => {
                return Err(BootloaderError::ConfigFailure {
                    context: "interpreter configuration",
                    reason: "runtime uses the legacy init protocol".to_string(),
                })
            }
        };

        let ptr = unsafe { (api.py_init_config_create)() };
        if ptr.is_null() {
            return Err(BootloaderError::ConfigFailure {
                context: "interpreter configuration",
                reason: "could not allocate init-config structure".to_string(),
            });
        }

        Ok(Self { dylib, api, ptr })
    }

    pub fn as_mut_ptr(&mut self) -> *mut PyInitConfig {
        self.ptr
    }

    /// Retrieve the runtime's description of the last failed setter.
    fn last_error(&self) -> String {
        let mut message: *const libc::c_char = std::ptr::null();
        unsafe { (self.api.py_init_config_get_error)(self.ptr, &mut message) };
        if message.is_null() {
            "no error details available".to_string()
        } else {
            unsafe { CStr::from_ptr(message) }.to_string_lossy().to_string()
        }
    }

    fn set_int(&mut self, key: &'static CStr, value: i64, context: &'static str) -> Result<()> {
        let rc = unsafe { (self.api.py_init_config_set_int)(self.ptr, key.as_ptr(), value) };
        if rc < 0 {
            Err(BootloaderError::ConfigFailure {
                context,
                reason: self.last_error(),
            })
        } else {
            Ok(())
        }
    }

    fn set_str(&mut self, key: &'static CStr, value: &str, context: &'static str) -> Result<()> {
        let value = CString::new(value).map_err(|_| BootloaderError::ConfigFailure {
            context,
            reason: "value contains an embedded NUL".to_string(),
        })?;

        let rc =
            unsafe { (self.api.py_init_config_set_str)(self.ptr, key.as_ptr(), value.as_ptr()) };
        if rc < 0 {
            Err(BootloaderError::ConfigFailure {
                context,
                reason: self.last_error(),
            })
        } else {
            Ok(())
        }
    }

    fn set_str_list(
        &mut self,
        key: &'static CStr,
        values: &[String],
        context: &'static str,
    ) -> Result<()> {
        let storage: Vec<CString> = values
            .iter()
            .map(|v| {
                CString::new(v.as_str()).map_err(|_| BootloaderError::ConfigFailure {
                    context,
                    reason: "value contains an embedded NUL".to_string(),
                })
            })
            .collect::<Result<_>>()?;
        let items: Vec<*const libc::c_char> = storage.iter().map(|v| v.as_ptr()).collect();

        let rc = unsafe {
            (self.api.py_init_config_set_str_list)(
                self.ptr,
                key.as_ptr(),
                items.len(),
                items.as_ptr(),
            )
        };
        if rc < 0 {
            Err(BootloaderError::ConfigFailure {
                context,
                reason: self.last_error(),
            })
        } else {
            Ok(())
        }
    }

    /// Convert a native string to the protocol's UTF-8.
    fn to_utf8(&self, value: &OsStr, context: &'static str) -> Result<String> {
        conversion::locale_to_utf8(self.dylib, value).map_err(|_| {
            BootloaderError::ConfigFailure {
                context,
                reason: format!("could not convert {:?} to UTF-8", value),
            }
        })
    }

    /// Program name; used for `sys.executable` and early error output.
    pub fn set_program_name(&mut self, ctx: &ProcessContext) -> Result<()> {
        let context = "setting program name";
        let name = self.to_utf8(ctx.executable.as_os_str(), context)?;
        self.set_str(c"program_name", &name, context)
    }

    /// Python home; anchors `sys.prefix` at the application root.
    pub fn set_python_home(&mut self, ctx: &ProcessContext) -> Result<()> {
        let context = "setting python home";
        let home = self.to_utf8(ctx.application_home.as_os_str(), context)?;
        self.set_str(c"home", &home, context)
    }

    /// The three fixed module search paths; the protocol sets the
    /// "paths were set" flag implicitly when the list is assigned.
    pub fn set_module_search_paths(&mut self, home: &Path) -> Result<()> {
        let context = "setting module search paths";
        let paths = module_search_paths(
            home,
            self.dylib.version_major(),
            self.dylib.version_minor(),
        );

        let utf8: Vec<String> = paths
            .iter()
            .map(|p| self.to_utf8(p.as_os_str(), context))
            .collect::<Result<_>>()?;

        self.set_str_list(c"module_search_paths", &utf8, context)
    }

    /// `sys.argv`, from the rewritten arguments when present.
    pub fn set_argv(&mut self, ctx: &ProcessContext) -> Result<()> {
        let context = "setting sys.argv";
        let argv: Vec<String> = ctx
            .effective_argv()
            .iter()
            .map(|arg| self.to_utf8(arg.as_os_str(), context))
            .collect::<Result<_>>()?;

        self.set_str_list(c"argv", &argv, context)
    }

    /// Start the interpreter from this configuration.
    pub fn initialize(&mut self) -> Result<()> {
        let rc = unsafe { (self.api.py_initialize_from_init_config)(self.ptr) };
        if rc < 0 {
            Err(BootloaderError::ConfigFailure {
                context: "starting interpreter",
                reason: self.last_error(),
            })
        } else {
            Ok(())
        }
    }

    /// Apply the runtime options record on top of the defaults.
    pub fn set_runtime_options(&mut self, options: &RuntimeOptions) -> Result<()> {
        self.set_int(c"site_import", 0, "setting site_import")?;
        self.set_int(c"write_bytecode", 0, "setting write_bytecode")?;
        self.set_int(c"configure_c_stdio", 1, "setting configure_c_stdio")?;

        self.set_int(
            c"optimization_level",
            i64::from(options.optimize),
            "setting optimization_level",
        )?;
        self.set_int(
            c"buffered_stdio",
            i64::from(!options.unbuffered),
            "setting buffered_stdio",
        )?;
        self.set_int(c"verbose", i64::from(options.verbose), "setting verbose")?;

        self.set_int(
            c"use_hash_seed",
            i64::from(options.use_hash_seed),
            "setting use_hash_seed",
        )?;
        self.set_int(
            c"hash_seed",
            options.hash_seed as i64,
            "setting hash_seed",
        )?;

        // Re-assert what pre-initialization already configured.
        self.set_int(c"dev_mode", i64::from(options.dev_mode), "setting dev_mode")?;

        // Interpreter signal handlers have always been installed by this
        // bootloader's predecessors; user code depends on it.
        self.set_int(
            c"install_signal_handlers",
            1,
            "setting install_signal_handlers",
        )?;

        self.set_str_list(c"warnoptions", &options.wflags, "setting warnoptions")?;
        self.set_str_list(c"xoptions", &options.xflags, "setting xoptions")?;

        Ok(())
    }
}

impl Drop for StableConfig<'_> {
    fn drop(&mut self) {
        unsafe { (self.api.py_init_config_free)(self.ptr) };
    }
}
