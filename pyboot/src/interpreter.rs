// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Starting the embedded interpreter and handing control to user code.
//!
//! The sequence is: read runtime options from the archive, pre-init,
//! fill the main configuration (through whichever init protocol the
//! runtime supports), start the interpreter, publish `sys._MEIPASS`,
//! execute the bootstrap code objects from the archive, publish the PYZ
//! location hint, run the user entry-point scripts, and finalize.

use {
    crate::{
        archive::EntryType,
        context::ProcessContext,
        conversion,
        dylib::{DylibPython, InitApi, PyObject},
        error::{BootloaderError, Result},
        interpreter_config::{self, pep587::LegacyConfig, pep741::StableConfig},
        logging::emit_error_message,
        options::{read_runtime_options, FlagEncoding},
    },
    libc::{c_char, c_ulonglong},
    slog::debug,
    std::{ffi::CString, io::Write, path::Path},
};

/// Pre-initialize, configure, and start the embedded interpreter.
pub fn start_interpreter(ctx: &ProcessContext) -> Result<()> {
    let dylib = ctx.dylib();
    let archive = ctx.archive();

    // The legacy protocol needs a known config layout; reject an
    // unsupported runtime version before touching the interpreter at
    // all.
    if !dylib.uses_stable_init()
        && interpreter_config::pep587_layouts::select_layout(dylib.version, ctx.nogil_enabled)
            .is_none()
    {
        return Err(BootloaderError::UnsupportedPythonVersion {
            major: dylib.version_major(),
            minor: dylib.version_minor(),
        });
    }

    let encoding = if dylib.uses_stable_init() {
        FlagEncoding::Utf8
    } else {
        FlagEncoding::Wide
    };
    let options = read_runtime_options(archive, encoding)?;

    debug!(ctx.log, "pre-initializing embedded interpreter");
    interpreter_config::preinit(dylib, &options)?;

    // In unbuffered mode, flush our own stdio before the interpreter
    // reconfigures the C streams out from under the old buffers.
    if options.unbuffered {
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
    }

    match &dylib.init_api {
        InitApi::Stable(_) => {
            debug!(ctx.log, "configuring interpreter (new init protocol)");
            let mut config = StableConfig::new(dylib)?;
            config.set_program_name(ctx)?;
            config.set_python_home(ctx)?;
            config.set_module_search_paths(&ctx.application_home)?;
            config.set_argv(ctx)?;
            config.set_runtime_options(&options)?;

            debug!(ctx.log, "starting embedded interpreter");
            config.initialize()?;
        }
        InitApi::Legacy(_) => {
            debug!(ctx.log, "configuring interpreter (legacy init protocol)");
            let mut config = LegacyConfig::new(dylib, ctx.nogil_enabled)?;
            config.set_program_name(ctx)?;
            config.set_python_home(ctx)?;
            config.set_module_search_paths(&ctx.application_home)?;
            config.set_argv(ctx)?;
            config.set_runtime_options(&options)?;

            debug!(ctx.log, "starting embedded interpreter");
            config.initialize()?;
        }
    }

    Ok(())
}

/// Decode a native path into a Python str object, using the platform's
/// preferred filesystem decoding.
fn path_to_py_str(dylib: &DylibPython, path: &Path) -> Result<*mut PyObject> {
    let native = conversion::osstr_to_cstring(path.as_os_str())?;

    #[cfg(windows)]
    let obj = unsafe {
        (dylib.common.py_unicode_decode)(
            native.as_ptr(),
            native.as_bytes().len(),
            c"utf-8".as_ptr(),
            c"strict".as_ptr(),
        )
    };

    #[cfg(not(windows))]
    let obj = unsafe { (dylib.common.py_unicode_decode_fs_default)(native.as_ptr()) };

    if obj.is_null() {
        Err(BootloaderError::ConfigFailure {
            context: "decoding path",
            reason: format!("could not decode {}", path.display()),
        })
    } else {
        Ok(obj)
    }
}

/// Publish `sys._MEIPASS` and execute every bootstrap code object
/// (PYMODULE / PYPACKAGE entries) under its entry name. The first
/// failing unmarshal or execution aborts the launch.
pub fn import_bootstrap_modules(ctx: &ProcessContext) -> Result<()> {
    let dylib = ctx.dylib();
    let archive = ctx.archive();

    debug!(ctx.log, "setting sys._MEIPASS");
    let meipass = path_to_py_str(dylib, &ctx.application_home)?;
    let rc = unsafe { (dylib.common.py_sys_set_object)(c"_MEIPASS".as_ptr(), meipass) };
    unsafe { (dylib.common.py_dec_ref)(meipass) };
    if rc != 0 {
        return Err(BootloaderError::ConfigFailure {
            context: "setting sys._MEIPASS",
            reason: "PySys_SetObject failed".to_string(),
        });
    }

    for entry in archive.toc_entries() {
        if entry.type_code != EntryType::PyModule && entry.type_code != EntryType::PyPackage {
            continue;
        }

        let data = archive.extract(&entry).map_err(BootloaderError::from)?;
        debug!(ctx.log, "executing bootstrap module {}", entry.name);

        let code = unsafe {
            (dylib.common.py_marshal_read_object_from_string)(
                data.as_ptr() as *const c_char,
                data.len(),
            )
        };

        let module = if code.is_null() {
            std::ptr::null_mut()
        } else {
            let name = CString::new(entry.name).map_err(|_| {
                BootloaderError::ArchiveFormat(format!("entry name {:?} has NUL", entry.name))
            })?;
            unsafe { (dylib.common.py_import_exec_code_module)(name.as_ptr(), code) }
        };

        unsafe {
            if !(dylib.common.py_err_occurred)().is_null() {
                (dylib.common.py_err_print)();
                (dylib.common.py_err_clear)();
            }
        }

        if module.is_null() {
            return Err(BootloaderError::ConfigFailure {
                context: "importing bootstrap modules",
                reason: format!("module {} failed to execute", entry.name),
            });
        }
    }

    Ok(())
}

/// Publish `sys._pyinstaller_pyz` as `"<archive-path>?<offset>"`, where
/// the offset is absolute within the archive file, so the in-band
/// importer can seek straight to the module database.
pub fn install_pyz_hint(ctx: &ProcessContext) -> Result<()> {
    let dylib = ctx.dylib();
    let archive = ctx.archive();

    let entry = archive
        .find_entry(EntryType::PyzArchive)
        .ok_or_else(|| BootloaderError::ArchiveFormat("no PYZ entry in TOC".to_string()))?;

    let archive_path = path_to_py_str(dylib, archive.path())?;
    let pyz_offset = archive.pkg_offset() + u64::from(entry.offset);

    let hint = unsafe {
        (dylib.common.py_unicode_from_format)(
            c"%U?%llu".as_ptr(),
            archive_path,
            pyz_offset as c_ulonglong,
        )
    };
    unsafe { (dylib.common.py_dec_ref)(archive_path) };

    if hint.is_null() {
        return Err(BootloaderError::ConfigFailure {
            context: "formatting PYZ location hint",
            reason: "PyUnicode_FromFormat failed".to_string(),
        });
    }

    let rc = unsafe { (dylib.common.py_sys_set_object)(c"_pyinstaller_pyz".as_ptr(), hint) };
    unsafe { (dylib.common.py_dec_ref)(hint) };

    if rc != 0 {
        return Err(BootloaderError::ConfigFailure {
            context: "setting sys._pyinstaller_pyz",
            reason: "PySys_SetObject failed".to_string(),
        });
    }

    debug!(ctx.log, "PYZ location hint installed");
    Ok(())
}

/// Execute the user entry-point scripts (SCRIPT entries) as `__main__`,
/// in archive order. Returns the process exit code.
pub fn run_entry_scripts(ctx: &ProcessContext) -> Result<i32> {
    let dylib = ctx.dylib();
    let archive = ctx.archive();

    for entry in archive.toc_entries() {
        if entry.type_code != EntryType::Script {
            continue;
        }

        debug!(ctx.log, "running entry script {}", entry.name);
        let data = archive.extract(&entry).map_err(BootloaderError::from)?;

        let code = unsafe {
            (dylib.common.py_marshal_read_object_from_string)(
                data.as_ptr() as *const c_char,
                data.len(),
            )
        };
        if code.is_null() {
            return Err(BootloaderError::ConfigFailure {
                context: "running entry script",
                reason: format!("could not unmarshal code object for {}", entry.name),
            });
        }

        let rv = unsafe {
            let main_module = (dylib.common.py_import_add_module)(c"__main__".as_ptr());
            if main_module.is_null() {
                return Err(BootloaderError::ConfigFailure {
                    context: "running entry script",
                    reason: "could not obtain __main__ module".to_string(),
                });
            }

            // Scripts expect a __file__ anchored at the application root.
            let script_path = ctx.application_home.join(format!("{}.py", entry.name));
            let file_obj = path_to_py_str(dylib, &script_path)?;
            (dylib.common.py_object_set_attr_string)(
                main_module,
                c"__file__".as_ptr(),
                file_obj,
            );
            (dylib.common.py_dec_ref)(file_obj);

            let main_dict = (dylib.common.py_module_get_dict)(main_module);
            (dylib.common.py_eval_eval_code)(code, main_dict, main_dict)
        };

        unsafe { (dylib.common.py_dec_ref)(code) };

        if rv.is_null() {
            report_unhandled_exception(ctx, entry.name);
            return Ok(1);
        }
        unsafe { (dylib.common.py_dec_ref)(rv) };
    }

    Ok(0)
}

/// Surface an uncaught exception from a user script. Console builds let
/// the interpreter print the traceback; windowed builds format it (via
/// the `traceback` module) into a message for the windowed channel,
/// unless traceback display was disabled at build time.
fn report_unhandled_exception(ctx: &ProcessContext, script_name: &str) {
    let dylib = ctx.dylib();

    if !cfg!(feature = "windowed") {
        unsafe { (dylib.common.py_err_print)() };
        return;
    }

    let message = if ctx.disable_windowed_traceback {
        format!(
            "Unhandled exception in script {}: traceback display is disabled",
            script_name
        )
    } else {
        match format_traceback(dylib) {
            Some(tb) => format!("Unhandled exception in script {}:\n{}", script_name, tb),
            None => format!("Unhandled exception in script {}", script_name),
        }
    };

    unsafe { (dylib.common.py_err_clear)() };
    emit_error_message(&message);
}

/// Render the pending exception with `traceback.format_exception`.
fn format_traceback(dylib: &DylibPython) -> Option<String> {
    unsafe {
        let mut etype: *mut PyObject = std::ptr::null_mut();
        let mut evalue: *mut PyObject = std::ptr::null_mut();
        let mut etraceback: *mut PyObject = std::ptr::null_mut();

        (dylib.common.py_err_fetch)(&mut etype, &mut evalue, &mut etraceback);
        if etype.is_null() {
            return None;
        }
        (dylib.common.py_err_normalize_exception)(&mut etype, &mut evalue, &mut etraceback);

        let traceback_module = (dylib.common.py_import_import_module)(c"traceback".as_ptr());
        if traceback_module.is_null() {
            (dylib.common.py_err_restore)(etype, evalue, etraceback);
            return None;
        }

        let format_exception = (dylib.common.py_object_get_attr_string)(
            traceback_module,
            c"format_exception".as_ptr(),
        );
        if format_exception.is_null() {
            (dylib.common.py_err_restore)(etype, evalue, etraceback);
            return None;
        }

        let lines: *mut PyObject = (dylib.common.py_object_call_function_obj_args)(
            format_exception,
            etype,
            evalue,
            etraceback,
            std::ptr::null_mut::<PyObject>(),
        );
        (dylib.common.py_dec_ref)(format_exception);
        if lines.is_null() {
            (dylib.common.py_err_clear)();
            (dylib.common.py_err_restore)(etype, evalue, etraceback);
            return None;
        }

        let separator = (dylib.common.py_unicode_from_string)(c"".as_ptr());
        let text = (dylib.common.py_unicode_join)(separator, lines);
        (dylib.common.py_dec_ref)(separator);
        (dylib.common.py_dec_ref)(lines);
        if text.is_null() {
            (dylib.common.py_err_clear)();
            return None;
        }

        let utf8 = (dylib.common.py_unicode_as_utf8)(text);
        let result = if utf8.is_null() {
            None
        } else {
            Some(
                std::ffi::CStr::from_ptr(utf8)
                    .to_string_lossy()
                    .to_string(),
            )
        };
        (dylib.common.py_dec_ref)(text);

        result
    }
}

/// Flush the interpreter's text streams and finalize it. A no-op when
/// the library was never loaded or the interpreter never came up.
pub fn finalize(ctx: &ProcessContext) {
    let dylib = match &ctx.dylib {
        Some(dylib) => dylib,
        None => return,
    };

    if unsafe { (dylib.common.py_is_initialized)() } == 0 {
        return;
    }

    // The interpreter's own main() flushes before finalizing; embedded
    // use has to do the same by hand. Skipped in windowed builds, where
    // the standard streams may not exist at all.
    if !cfg!(feature = "windowed") {
        debug!(ctx.log, "flushing interpreter stdout/stderr");
        const FLUSH_STDOUT: &std::ffi::CStr = c"import sys; sys.stdout.flush(); \
             (sys.__stdout__.flush if sys.__stdout__ is not sys.stdout else (lambda: None))()";
        const FLUSH_STDERR: &std::ffi::CStr = c"import sys; sys.stderr.flush(); \
             (sys.__stderr__.flush if sys.__stderr__ is not sys.stderr else (lambda: None))()";

        unsafe {
            (dylib.common.py_run_simple_string_flags)(FLUSH_STDOUT.as_ptr(), std::ptr::null_mut());
            (dylib.common.py_run_simple_string_flags)(FLUSH_STDERR.as_ptr(), std::ptr::null_mut());
        }
    }

    debug!(ctx.log, "finalizing embedded interpreter");
    unsafe { (dylib.common.py_finalize)() };
}
