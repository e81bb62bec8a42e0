// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Splash-screen lifecycle interface.
//!
//! The splash UI itself (Tcl/Tk script, window, IPC with the
//! in-interpreter splash module) is a collaborator; the bootloader's
//! responsibilities end at the lifecycle: locate the splash resource
//! bundle in the archive, extract its dependencies in single-file mode,
//! load the Tcl/Tk shared libraries, hand the script to a fresh Tcl
//! interpreter, and tear everything down before the application root is
//! deleted. Splash failures are warnings, never fatal.

use {
    crate::{
        archive::EntryType,
        context::ProcessContext,
        dylib::SharedLibrary,
        error::{BootloaderError, Result},
    },
    byteorder::{BigEndian, ReadBytesExt},
    libc::{c_char, c_int},
    slog::{debug, warn},
    std::{ffi::CString, io::Read, path::Path},
};

/// Parsed splash resource bundle.
///
/// The bundle layout is produced by the build toolchain: three
/// NUL-padded 32-byte name fields (Tcl library, Tk library, Tk data
/// directory), two big-endian u32 lengths (script, requirements), the
/// Tcl script, and the requirement names separated by NUL bytes.
#[derive(Debug, Default, PartialEq)]
pub struct SplashResources {
    pub tcl_libname: String,
    pub tk_libname: String,
    pub tk_data_dir: String,
    pub script: Vec<u8>,
    /// Names of archive entries the splash screen needs extracted
    /// before it can start (shared libraries, .tcl files, ...).
    pub requirements: Vec<String>,
}

impl SplashResources {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(data);

        let read_name = |cursor: &mut std::io::Cursor<&[u8]>| -> Result<String> {
            let mut field = [0u8; 32];
            cursor
                .read_exact(&mut field)
                .map_err(|_| splash_format_error("truncated name field"))?;
            let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
            String::from_utf8(field[..end].to_vec())
                .map_err(|_| splash_format_error("name field is not UTF-8"))
        };

        let tcl_libname = read_name(&mut cursor)?;
        let tk_libname = read_name(&mut cursor)?;
        let tk_data_dir = read_name(&mut cursor)?;

        let script_len = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| splash_format_error("truncated script length"))? as usize;
        let requirements_len = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| splash_format_error("truncated requirements length"))?
            as usize;

        let mut script = vec![0u8; script_len];
        cursor
            .read_exact(&mut script)
            .map_err(|_| splash_format_error("truncated script"))?;

        let mut requirements_raw = vec![0u8; requirements_len];
        cursor
            .read_exact(&mut requirements_raw)
            .map_err(|_| splash_format_error("truncated requirements"))?;

        let requirements = requirements_raw
            .split(|&b| b == 0)
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| {
                String::from_utf8(chunk.to_vec())
                    .map_err(|_| splash_format_error("requirement name is not UTF-8"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            tcl_libname,
            tk_libname,
            tk_data_dir,
            script,
            requirements,
        })
    }
}

fn splash_format_error(detail: &str) -> BootloaderError {
    BootloaderError::ArchiveFormat(format!("splash resources: {}", detail))
}

/// Run-time state of the splash screen in the process that owns it.
/// Holds no back-reference to the process context; callers pass it in.
pub struct SplashContext {
    resources: Option<SplashResources>,
    tcltk: Option<TcltkLibraries>,
    interpreter: *mut TclInterp,
}

impl Default for SplashContext {
    fn default() -> Self {
        Self {
            resources: None,
            tcltk: None,
            interpreter: std::ptr::null_mut(),
        }
    }
}

/// Opaque Tcl interpreter handle.
#[repr(C)]
pub struct TclInterp {
    _private: [u8; 0],
}

impl SplashContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and parse the splash resource bundle from the archive.
    pub fn setup(&mut self, ctx: &ProcessContext) -> Result<()> {
        let archive = ctx.archive();
        let entry = archive
            .find_entry(EntryType::SplashResources)
            .ok_or_else(|| splash_format_error("no resource entry in TOC"))?;

        let data = archive.extract(&entry).map_err(BootloaderError::from)?;
        let resources = SplashResources::parse(&data)?;
        debug!(
            ctx.log,
            "splash resources: tcl={} tk={} requirements={}",
            resources.tcl_libname,
            resources.tk_libname,
            resources.requirements.len()
        );

        self.resources = Some(resources);
        Ok(())
    }

    /// Extract the splash screen's dependencies into the application
    /// root. Only meaningful in single-file mode; directory builds ship
    /// the dependencies on disk already.
    pub fn extract(&mut self, ctx: &ProcessContext) -> Result<()> {
        let resources = self
            .resources
            .as_ref()
            .ok_or_else(|| splash_format_error("setup was not performed"))?;
        let archive = ctx.archive();

        for requirement in &resources.requirements {
            let entry = archive
                .toc_entries()
                .find(|e| e.name == requirement.as_str())
                .ok_or_else(|| {
                    splash_format_error(&format!("requirement {} not in TOC", requirement))
                })?;

            let data = archive.extract(&entry).map_err(BootloaderError::from)?;
            crate::osutils::write_extracted_file(
                ctx,
                &ctx.application_home,
                entry.name,
                &data,
            )?;
        }

        Ok(())
    }

    /// Whether an archive entry belongs to the splash screen's
    /// dependencies. The main extraction pass skips these: they were
    /// already materialized when the splash screen was set up.
    pub fn is_requirement(&self, name: &str) -> bool {
        self.resources
            .as_ref()
            .map(|r| r.requirements.iter().any(|req| req == name))
            .unwrap_or(false)
    }

    /// Load the Tcl and Tk shared libraries from the application root.
    pub fn load_shared_libraries(&mut self, ctx: &ProcessContext) -> Result<()> {
        let resources = self
            .resources
            .as_ref()
            .ok_or_else(|| splash_format_error("setup was not performed"))?;

        let tcltk = TcltkLibraries::load(
            &ctx.log,
            &ctx.application_home.join(&resources.tcl_libname),
            &ctx.application_home.join(&resources.tk_libname),
        )?;
        self.tcltk = Some(tcltk);
        Ok(())
    }

    /// Start the splash screen: point Tcl/Tk at the extracted data
    /// directory, create an interpreter, and evaluate the splash script.
    pub fn start(&mut self, ctx: &ProcessContext, executable: &Path) -> Result<()> {
        let resources = self
            .resources
            .as_ref()
            .ok_or_else(|| splash_format_error("setup was not performed"))?;
        let tcltk = self
            .tcltk
            .as_ref()
            .ok_or_else(|| splash_format_error("shared libraries were not loaded"))?;

        let data_dir = ctx.application_home.join(&resources.tk_data_dir);
        std::env::set_var("TCL_LIBRARY", data_dir.join("tcl"));
        std::env::set_var("TK_LIBRARY", data_dir.join("tk"));

        let exe = crate::conversion::osstr_to_cstring(executable.as_os_str())?;
        unsafe { (tcltk.tcl_find_executable)(exe.as_ptr()) };

        let interp = unsafe { (tcltk.tcl_create_interp)() };
        if interp.is_null() {
            return Err(BootloaderError::PlatformFailure {
                context: "splash screen",
                reason: "could not create Tcl interpreter".to_string(),
            });
        }
        self.interpreter = interp;

        unsafe {
            if (tcltk.tcl_init)(interp) != 0 {
                warn!(ctx.log, "Tcl initialization reported failure");
            }
            if (tcltk.tk_init)(interp) != 0 {
                warn!(ctx.log, "Tk initialization reported failure");
            }
        }

        let script = CString::new(resources.script.clone())
            .map_err(|_| splash_format_error("script contains NUL bytes"))?;
        let rc = unsafe {
            (tcltk.tcl_eval_ex)(
                interp,
                script.as_ptr(),
                resources.script.len() as c_int,
                0,
            )
        };
        if rc != 0 {
            return Err(BootloaderError::PlatformFailure {
                context: "splash screen",
                reason: "splash script evaluation failed".to_string(),
            });
        }

        debug!(ctx.log, "splash screen started");
        Ok(())
    }

    /// Tear the splash screen down. Must run before the application
    /// root is deleted: the loaded Tcl/Tk libraries hold open handles
    /// into it. Safe to call at any lifecycle stage, and repeatedly.
    pub fn finalize(&mut self) {
        if let Some(tcltk) = self.tcltk.take() {
            unsafe {
                if !self.interpreter.is_null() {
                    (tcltk.tcl_delete_interp)(self.interpreter);
                    self.interpreter = std::ptr::null_mut();
                }
                (tcltk.tcl_finalize)();
            }
        }
        self.resources = None;
    }
}

impl Drop for SplashContext {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// The dynamically loaded Tcl and Tk libraries and the symbols the
/// lifecycle needs. Bound the same way as the Python library.
struct TcltkLibraries {
    _tcl: SharedLibrary,
    _tk: SharedLibrary,

    tcl_find_executable: unsafe extern "C" fn(*const c_char),
    tcl_create_interp: unsafe extern "C" fn() -> *mut TclInterp,
    tcl_init: unsafe extern "C" fn(*mut TclInterp) -> c_int,
    tk_init: unsafe extern "C" fn(*mut TclInterp) -> c_int,
    tcl_eval_ex: unsafe extern "C" fn(*mut TclInterp, *const c_char, c_int, c_int) -> c_int,
    tcl_delete_interp: unsafe extern "C" fn(*mut TclInterp),
    tcl_finalize: unsafe extern "C" fn(),
}

impl TcltkLibraries {
    fn load(log: &slog::Logger, tcl_path: &Path, tk_path: &Path) -> Result<Self> {
        debug!(log, "loading Tcl shared library: {}", tcl_path.display());
        let tcl = SharedLibrary::open(tcl_path).map_err(|reason| BootloaderError::DynLibLoad {
            library: tcl_path.to_path_buf(),
            reason,
        })?;

        debug!(log, "loading Tk shared library: {}", tk_path.display());
        let tk = SharedLibrary::open(tk_path).map_err(|reason| BootloaderError::DynLibLoad {
            library: tk_path.to_path_buf(),
            reason,
        })?;

        macro_rules! tcl_symbol {
            ($lib:expr, $name:literal) => {{
                let address = $lib.symbol($name);
                if address.is_null() {
                    return Err(BootloaderError::SymbolMissing($name));
                }
                unsafe { std::mem::transmute(address) }
            }};
        }

        Ok(Self {
            tcl_find_executable: tcl_symbol!(tcl, "Tcl_FindExecutable"),
            tcl_create_interp: tcl_symbol!(tcl, "Tcl_CreateInterp"),
            tcl_init: tcl_symbol!(tcl, "Tcl_Init"),
            tk_init: tcl_symbol!(tk, "Tk_Init"),
            tcl_eval_ex: tcl_symbol!(tcl, "Tcl_EvalEx"),
            tcl_delete_interp: tcl_symbol!(tcl, "Tcl_DeleteInterp"),
            tcl_finalize: tcl_symbol!(tcl, "Tcl_Finalize"),
            _tcl: tcl,
            _tk: tk,
        })
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::testutil::build_splash_payload};

    #[test]
    fn parse_round_trips_builder_output() {
        let payload = build_splash_payload(
            "libtcl8.6.so",
            "libtk8.6.so",
            "_tcl_data",
            b"proc show {} {}",
            &["libtcl8.6.so", "libtk8.6.so", "_tcl_data/tcl/init.tcl"],
        );

        let resources = SplashResources::parse(&payload).unwrap();
        assert_eq!(resources.tcl_libname, "libtcl8.6.so");
        assert_eq!(resources.tk_libname, "libtk8.6.so");
        assert_eq!(resources.tk_data_dir, "_tcl_data");
        assert_eq!(resources.script, b"proc show {} {}");
        assert_eq!(resources.requirements.len(), 3);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let payload = build_splash_payload("tcl", "tk", "data", b"script", &[]);
        for cut in [10, 96, payload.len() - 1] {
            assert!(SplashResources::parse(&payload[..cut]).is_err());
        }
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut splash = SplashContext::new();
        splash.finalize();
        splash.finalize();
    }
}
