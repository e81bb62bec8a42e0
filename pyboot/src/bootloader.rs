// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The bootloader orchestrator: role resolution, environment handling,
//! application-root setup, and the two process codepaths.

use {
    crate::{
        archive::{self, Archive, EntryType},
        context::{HideConsole, Platform, ProcessContext, ProcessLevel},
        dylib::DylibPython,
        error::{BootloaderError, Result},
        interpreter, osutils,
        splash::SplashContext,
    },
    slog::{debug, warn},
    std::{
        ffi::OsString,
        path::{Path, PathBuf},
    },
};

const ENV_ARCHIVE_FILE: &str = "_PYI_ARCHIVE_FILE";
const ENV_PARENT_PROCESS_LEVEL: &str = "_PYI_PARENT_PROCESS_LEVEL";
const ENV_APPLICATION_HOME_DIR: &str = "_PYI_APPLICATION_HOME_DIR";
const ENV_SPLASH_IPC: &str = "_PYI_SPLASH_IPC";

/// Run the bootloader. Returns the process exit code.
pub fn run(log: slog::Logger, argv: Vec<OsString>) -> Result<i32> {
    let mut ctx = ProcessContext::new(log, argv);

    if cfg!(debug_assertions) {
        for (i, arg) in ctx.argv.iter().enumerate() {
            debug!(ctx.log, "argv[{}]: {:?}", i, arg);
        }
    }

    let (executable, dynamic_loader) = osutils::resolve_executable(&ctx.argv)?;
    debug!(ctx.log, "executable file: {}", executable.display());
    ctx.executable = executable;
    ctx.dynamic_loader = dynamic_loader;

    resolve_archive(&mut ctx)?;
    debug!(ctx.log, "archive file: {}", ctx.archive_path.display());

    ctx.is_onefile = ctx.archive().contains_extractable_entries();
    debug!(
        ctx.log,
        "application has {} semantics",
        if ctx.is_onefile { "single-file" } else { "directory" }
    );

    ctx.has_splash = ctx.archive().has_splash_resources();
    if ctx.has_splash {
        ctx.suppress_splash =
            std::env::var("PYINSTALLER_SUPPRESS_SPLASH_SCREEN").as_deref() == Ok("1");
    }

    reset_environment_if_needed(&mut ctx)?;
    classify_process(&mut ctx)?;

    read_bootloader_options(&mut ctx)?;

    // Early console hiding (win32 console builds).
    #[cfg(all(windows, not(feature = "windowed")))]
    match ctx.hide_console {
        HideConsole::HideEarly => osutils::windows::hide_console(),
        HideConsole::MinimizeEarly => osutils::windows::minimize_console(),
        _ => {}
    }

    if let Ok(value) = std::env::var("PYINSTALLER_STRICT_UNPACK_MODE") {
        ctx.strict_unpack_mode = value != "0";
    }

    // Carry the process name across restarts and into child processes;
    // it is lost when a symlinked executable re-execs itself.
    #[cfg(target_os = "linux")]
    if ctx.parent_process_level == ProcessLevel::Unknown {
        osutils::posix::store_process_name(&ctx.log);
    } else {
        osutils::posix::restore_process_name(&ctx.log);
    }

    resolve_application_home(&mut ctx)?;
    debug!(
        ctx.log,
        "application root directory: {}",
        ctx.application_home.display()
    );

    configure_library_search_path(&mut ctx)?;

    setup_splash_screen(&mut ctx);

    if ctx.is_onefile && ctx.process_level == ProcessLevel::Parent {
        run_onefile_parent(&mut ctx)
    } else {
        run_application(&mut ctx)
    }
}

/// Open the archive embedded in the executable, falling back to a
/// sibling `.pkg` when the executable carries the side-load marker.
fn resolve_archive(ctx: &mut ProcessContext) -> Result<()> {
    debug!(ctx.log, "probing for embedded archive");
    match Archive::open(&ctx.executable) {
        Ok(archive) => {
            ctx.archive_path = ctx.executable.clone();
            ctx.archive = Some(archive);
            return Ok(());
        }
        Err(err) => {
            debug!(ctx.log, "no embedded archive: {}", err);
        }
    }

    if !archive::executable_allows_sideload(&ctx.executable)? {
        return Err(BootloaderError::ArchiveNotFound(format!(
            "no archive embedded in {} and side-loading is not enabled",
            ctx.executable.display()
        )));
    }

    let sideload_path = sideload_archive_path(&ctx.executable, Platform::current());
    debug!(
        ctx.log,
        "trying side-loaded archive: {}",
        sideload_path.display()
    );

    let archive = Archive::open(&sideload_path)?;
    ctx.archive_path = sideload_path;
    ctx.archive = Some(archive);
    Ok(())
}

/// Side-load archive naming: the `.exe` suffix is replaced on win32,
/// a `.pkg` suffix is appended elsewhere.
fn sideload_archive_path(executable: &Path, platform: Platform) -> PathBuf {
    if platform == Platform::Win32 {
        executable.with_extension("pkg")
    } else {
        let mut name = executable.as_os_str().to_os_string();
        name.push(".pkg");
        PathBuf::from(name)
    }
}

/// Decide whether to inherit the surrounding bootloader environment or
/// wipe it: an explicit user request, or an inherited environment that
/// belongs to a different program, forces the wipe.
fn reset_environment_if_needed(ctx: &mut ProcessContext) -> Result<()> {
    let mut reset = false;

    if let Ok(value) = std::env::var("PYINSTALLER_RESET_ENVIRONMENT") {
        if value == "1" {
            debug!(ctx.log, "explicit environment reset requested");
            reset = true;
        }
        // Never propagate the request to child processes.
        std::env::remove_var("PYINSTALLER_RESET_ENVIRONMENT");
    }

    if !reset {
        reset = match std::env::var(ENV_ARCHIVE_FILE) {
            Ok(inherited) => Path::new(&inherited) != ctx.archive_path.as_path(),
            Err(_) => true,
        };
    }

    if reset {
        debug!(ctx.log, "resetting bootloader environment");
        std::env::set_var(ENV_ARCHIVE_FILE, &ctx.archive_path);
        std::env::remove_var(ENV_APPLICATION_HOME_DIR);
        std::env::remove_var(ENV_PARENT_PROCESS_LEVEL);
        std::env::remove_var(ENV_SPLASH_IPC);
        #[cfg(target_os = "linux")]
        std::env::remove_var("_PYI_LINUX_PROCESS_NAME");
    }

    Ok(())
}

/// Read the inherited process level, resolve this process's own level,
/// and publish it for potential children.
fn classify_process(ctx: &mut ProcessContext) -> Result<()> {
    ctx.parent_process_level = match std::env::var(ENV_PARENT_PROCESS_LEVEL) {
        Ok(value) if !value.is_empty() => value.parse()?,
        _ => ProcessLevel::Unknown,
    };
    debug!(
        ctx.log,
        "parent process level: {}", ctx.parent_process_level
    );

    let splash_eligible = ctx.has_splash && !ctx.suppress_splash;
    ctx.process_level = resolve_process_level(
        ctx.parent_process_level,
        ctx.is_onefile,
        splash_eligible,
        Platform::current(),
    )?;
    debug!(ctx.log, "process level: {}", ctx.process_level);

    // Publish our level for child processes. Spawned subprocesses do
    // not track levels beyond their own.
    if ctx.process_level < ProcessLevel::Subprocess {
        std::env::set_var(ENV_PARENT_PROCESS_LEVEL, ctx.process_level.to_string());
    }

    Ok(())
}

/// The role-resolution state machine: given the observed parent level
/// and the launch configuration, decide what this process is.
pub fn resolve_process_level(
    parent: ProcessLevel,
    is_onefile: bool,
    splash_eligible: bool,
    platform: Platform,
) -> Result<ProcessLevel> {
    match parent {
        ProcessLevel::Unknown => {
            // Entry-point process. Where the library search path lives
            // in the environment, a restart is needed before any
            // bundled shared library can be loaded: always for
            // directory builds, and for single-file builds that will
            // load Tcl/Tk for the splash screen in this process.
            Ok(if is_onefile {
                if platform.has_in_process_search_path() {
                    ProcessLevel::Parent
                } else if splash_eligible {
                    ProcessLevel::ParentNeedsRestart
                } else {
                    ProcessLevel::Parent
                }
            } else if platform.has_in_process_search_path() {
                ProcessLevel::Main
            } else {
                ProcessLevel::ParentNeedsRestart
            })
        }
        ProcessLevel::ParentNeedsRestart => {
            // Only reachable on platforms that restart; anywhere else
            // the inherited value is bogus.
            if platform.has_in_process_search_path() {
                return Err(BootloaderError::EnvironmentCorrupted(format!(
                    "unexpected parent process level: {}",
                    parent
                )));
            }
            Ok(if is_onefile {
                ProcessLevel::Parent
            } else {
                ProcessLevel::Main
            })
        }
        ProcessLevel::Parent => Ok(ProcessLevel::Main),
        ProcessLevel::Main => Ok(ProcessLevel::Subprocess),
        ProcessLevel::Subprocess => Err(BootloaderError::EnvironmentCorrupted(format!(
            "unexpected parent process level: {}",
            parent
        ))),
    }
}

/// Scan the TOC for bootloader-private runtime options (`pyi-` prefix)
/// and copy their values onto the context.
fn read_bootloader_options(ctx: &mut ProcessContext) -> Result<()> {
    let mut runtime_tmpdir = None;
    let mut contents_subdirectory = None;
    let mut hide_console = HideConsole::Unused;
    let mut disable_windowed_traceback = false;
    let mut macos_argv_emulation = false;
    let mut ignore_signals = false;
    let mut nogil_enabled = false;

    for entry in ctx.archive().toc_entries() {
        if entry.type_code != EntryType::RuntimeOption {
            continue;
        }
        let name = entry.name;

        if let Some(value) = name.strip_prefix("pyi-python-flag ") {
            // Build flags of the collected runtime that affect the
            // legacy config structure layout.
            if value == "Py_GIL_DISABLED" {
                nogil_enabled = true;
            }
        } else if let Some(value) = name.strip_prefix("pyi-runtime-tmpdir ") {
            runtime_tmpdir = Some(value.to_string());
        } else if let Some(value) = name.strip_prefix("pyi-contents-directory ") {
            contents_subdirectory = Some(value.to_string());
        } else if name == "pyi-macos-argv-emulation" {
            macos_argv_emulation = true;
        } else if let Some(value) = name.strip_prefix("pyi-hide-console ") {
            hide_console = HideConsole::from_option_value(value);
        } else if name == "pyi-disable-windowed-traceback" {
            disable_windowed_traceback = true;
        } else if name == "pyi-bootloader-ignore-signals" {
            ignore_signals = true;
        }
    }

    ctx.runtime_tmpdir = runtime_tmpdir;
    ctx.contents_subdirectory = contents_subdirectory;
    ctx.hide_console = hide_console;
    ctx.disable_windowed_traceback = disable_windowed_traceback;
    ctx.macos_argv_emulation = macos_argv_emulation;
    ctx.ignore_signals = ignore_signals;
    ctx.nogil_enabled = nogil_enabled;

    Ok(())
}

/// Whether a single-file process creates the ephemeral application
/// directory or inherits it from the environment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HomeDirAction {
    Create,
    Inherit,
}

pub fn onefile_home_action(level: ProcessLevel, parent: ProcessLevel) -> HomeDirAction {
    match level {
        // Before the restart: create now so Tcl/Tk dependencies can be
        // extracted; the restarted process inherits it.
        ProcessLevel::ParentNeedsRestart => HomeDirAction::Create,
        ProcessLevel::Parent if parent == ProcessLevel::ParentNeedsRestart => {
            HomeDirAction::Inherit
        }
        ProcessLevel::Parent => HomeDirAction::Create,
        _ => HomeDirAction::Inherit,
    }
}

/// Derive the application root of a directory build from the
/// executable's location: the darwin app-bundle layout re-anchors from
/// `Contents/MacOS` to `Contents/Frameworks`, everything else uses the
/// executable's directory plus the optional contents sub-directory.
pub fn derive_onedir_root(
    executable: &Path,
    contents_subdirectory: Option<&str>,
    platform: Platform,
) -> PathBuf {
    let executable_dir = executable.parent().unwrap_or_else(|| Path::new("."));

    if platform == Platform::Darwin {
        let is_app_bundle = executable_dir
            .to_string_lossy()
            .ends_with(".app/Contents/MacOS");
        if is_app_bundle {
            if let Some(contents_dir) = executable_dir.parent() {
                return contents_dir.join("Frameworks");
            }
        }
    }

    match contents_subdirectory {
        Some(subdir) => executable_dir.join(subdir),
        None => executable_dir.to_path_buf(),
    }
}

fn resolve_application_home(ctx: &mut ProcessContext) -> Result<()> {
    if !ctx.is_onefile {
        ctx.application_home = derive_onedir_root(
            &ctx.executable,
            ctx.contents_subdirectory.as_deref(),
            Platform::current(),
        );
        return Ok(());
    }

    match onefile_home_action(ctx.process_level, ctx.parent_process_level) {
        HomeDirAction::Create => {
            #[cfg(windows)]
            {
                ctx.security_attributes = Some(osutils::windows::SecurityAttributes::new()?);
            }

            let runtime_tmpdir = ctx.runtime_tmpdir.clone();
            ctx.application_home =
                osutils::create_restricted_temp_dir(ctx, runtime_tmpdir.as_deref())?;

            // The child process finds the directory through the
            // environment.
            std::env::set_var(ENV_APPLICATION_HOME_DIR, &ctx.application_home);
        }
        HomeDirAction::Inherit => {
            let inherited = std::env::var_os(ENV_APPLICATION_HOME_DIR)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| {
                    BootloaderError::EnvironmentCorrupted(format!(
                        "{} is not defined",
                        ENV_APPLICATION_HOME_DIR
                    ))
                })?;
            ctx.application_home = PathBuf::from(inherited);
        }
    }

    Ok(())
}

/// Make the application root visible to the dynamic linker before any
/// bundled shared library gets loaded. On POSIX systems this mutates
/// the environment and may require replacing the process image.
fn configure_library_search_path(ctx: &mut ProcessContext) -> Result<()> {
    #[cfg(windows)]
    {
        // Pre-load system VC runtime DLLs in the single-file parent
        // before the search path starts covering the bundled copies.
        if ctx.is_onefile && ctx.process_level == ProcessLevel::Parent {
            osutils::windows::preload_system_vc_runtime(&ctx.log);
        }

        osutils::windows::set_dll_directory(&ctx.application_home)?;
        Ok(())
    }

    #[cfg(target_os = "macos")]
    {
        // Library paths on collected binaries are rewritten at build
        // time; no run-time search path changes are needed.
        let _ = ctx;
        Ok(())
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    {
        // The environment change does not affect this process, only
        // processes spawned from it. The launcher roles export it for
        // their children; a process that must load bundled libraries
        // itself re-execs to pick the change up.
        let modify = ctx.process_level == ProcessLevel::ParentNeedsRestart
            || (ctx.process_level == ProcessLevel::Parent
                && ctx.parent_process_level != ProcessLevel::ParentNeedsRestart);

        if modify {
            osutils::posix::set_library_search_path(&ctx.log, &ctx.application_home)?;
        }

        if ctx.process_level == ProcessLevel::ParentNeedsRestart {
            debug!(
                ctx.log,
                "restarting so library search path changes take effect"
            );
            // Replaces the process image; returns only on failure.
            return Err(osutils::posix::restart_in_place(ctx).unwrap_err());
        }

        Ok(())
    }
}

/// Set the splash screen up in the role that owns it. All failures are
/// warnings: the application must come up even if its splash cannot.
fn setup_splash_screen(ctx: &mut ProcessContext) {
    if !ctx.has_splash {
        debug!(ctx.log, "no splash screen resources");
        return;
    }

    if ctx.suppress_splash {
        debug!(ctx.log, "splash screen suppressed by user");
        // Let the in-interpreter splash module know it should no-op.
        std::env::set_var(ENV_SPLASH_IPC, "0");
        return;
    }

    if ctx.process_level >= ProcessLevel::Subprocess {
        debug!(ctx.log, "subprocess; suppressing splash screen");
        std::env::set_var(ENV_SPLASH_IPC, "0");
        return;
    }

    let is_eligible = (ctx.is_onefile && ctx.process_level == ProcessLevel::Parent)
        || (!ctx.is_onefile && ctx.process_level == ProcessLevel::Main);
    if !is_eligible {
        debug!(ctx.log, "process not eligible for splash screen");
        return;
    }

    let mut splash = SplashContext::new();

    let result = (|| -> Result<()> {
        splash.setup(ctx)?;
        if ctx.is_onefile {
            splash.extract(ctx)?;
        }
        splash.load_shared_libraries(ctx)?;
        splash.start(ctx, &ctx.executable)
    })();

    match result {
        Ok(()) => ctx.splash = Some(splash),
        Err(err) => {
            warn!(ctx.log, "splash screen unavailable: {}", err);
            splash.finalize();
        }
    }
}

/// Single-file parent: unpack, spawn the main process, wait, clean up.
fn run_onefile_parent(ctx: &mut ProcessContext) -> Result<i32> {
    // Windowed darwin bundles: drop the launcher's psn argument and
    // optionally convert launch events into arguments here, so the
    // child is spawned with the cleaned argv.
    #[cfg(all(target_os = "macos", feature = "windowed"))]
    {
        if let Some(rewritten) = crate::apple_events::filter_psn_argument(&ctx.argv) {
            ctx.rewritten_argv = Some(rewritten);
        }
        if ctx.macos_argv_emulation {
            let mut argv = ctx
                .rewritten_argv
                .take()
                .unwrap_or_else(|| ctx.argv.clone());
            crate::apple_events::run_argv_emulation(&ctx.log, &mut argv);
            ctx.rewritten_argv = Some(argv);
        }
    }

    debug!(ctx.log, "extracting archive to application directory");
    if let Err(err) = extract_archive(ctx) {
        // Leave nothing behind even when unpacking failed midway.
        let _ = onefile_parent_cleanup(ctx);
        return Err(err);
    }

    // Extraction is complete; the restricted-ACL descriptor has served
    // its purpose.
    #[cfg(windows)]
    {
        ctx.security_attributes = None;
    }

    #[cfg(all(windows, not(feature = "windowed")))]
    match ctx.hide_console {
        HideConsole::HideLate => osutils::windows::hide_console(),
        HideConsole::MinimizeLate => osutils::windows::minimize_console(),
        _ => {}
    }

    // Dismiss the "program is starting" cursor while the child brings
    // its UI up.
    #[cfg(all(windows, feature = "windowed"))]
    if ctx.splash.is_none() {
        osutils::windows::dismiss_startup_cursor();
    }

    // The parent shows no UI of its own (except the splash screen);
    // keep it out of the Dock.
    #[cfg(all(target_os = "macos", feature = "windowed"))]
    crate::apple_events::transform_process_to_background();

    debug!(ctx.log, "starting the main application process");
    #[cfg(unix)]
    let exit_code = osutils::posix::spawn_and_wait_child(ctx);
    #[cfg(windows)]
    let exit_code = osutils::windows::spawn_and_wait_child(ctx);

    debug!(ctx.log, "child exited; cleaning up");
    let cleanup = onefile_parent_cleanup(ctx);

    let exit_code = exit_code?;
    if let Err(err) = cleanup {
        // Fatal only in strict mode; otherwise the child's exit code
        // stands and the leftover directory is just warned about.
        if ctx.strict_unpack_mode {
            return Err(err);
        }
        warn!(ctx.log, "{}", err);
    }

    // Inherit the child's exit disposition: re-raise its fatal signal
    // against ourselves, strictly after cleanup.
    #[cfg(unix)]
    if let Some(signal) = ctx.child_signal {
        osutils::posix::reraise_signal(&ctx.log, signal);
    }

    Ok(exit_code)
}

/// Unpack every extractable entry into the application root. Splash
/// requirements were already extracted during splash setup and are
/// skipped here.
fn extract_archive(ctx: &mut ProcessContext) -> Result<()> {
    let archive = ctx.archive.take().expect("archive accessed before resolution");

    let result = (|| -> Result<()> {
        for entry in archive.toc_entries() {
            if !entry.type_code.is_extractable() {
                continue;
            }

            if let Some(splash) = &ctx.splash {
                if splash.is_requirement(entry.name) {
                    continue;
                }
            }

            let data = archive.extract(&entry).map_err(BootloaderError::from)?;

            if entry.type_code == EntryType::Symlink {
                osutils::create_extracted_symlink(ctx, &ctx.application_home, entry.name, &data)?;
            } else {
                osutils::write_extracted_file(ctx, &ctx.application_home, entry.name, &data)?;
            }
        }
        Ok(())
    })();

    ctx.archive = Some(archive);
    result
}

/// Cleanup path of the single-file parent: splash teardown first (it
/// holds handles into the application directory), then the directory
/// itself, then the archive. Idempotent, so a session-shutdown handler
/// and the main path can both call it.
pub fn onefile_parent_cleanup(ctx: &mut ProcessContext) -> Result<()> {
    if let Some(mut splash) = ctx.splash.take() {
        splash.finalize();
    }

    let mut result = Ok(());

    if !ctx.application_home.as_os_str().is_empty() {
        debug!(
            ctx.log,
            "removing application directory: {}",
            ctx.application_home.display()
        );
        if let Err(err) = osutils::remove_directory_tree(&ctx.log, &ctx.application_home) {
            warn!(
                ctx.log,
                "could not remove {}: {}",
                ctx.application_home.display(),
                err
            );
            result = Err(BootloaderError::CleanupFailure(ctx.application_home.clone()));
        }
    }

    ctx.archive = None;

    result
}

/// Main / subprocess codepath: bring the interpreter up and run user
/// code.
fn run_application(ctx: &mut ProcessContext) -> Result<i32> {
    // Directory-build darwin app bundles filter the launcher's psn
    // argument and optionally convert launch events into arguments. In
    // single-file mode the parent already did both.
    #[cfg(all(target_os = "macos", feature = "windowed"))]
    if !ctx.is_onefile {
        if let Some(rewritten) = crate::apple_events::filter_psn_argument(&ctx.argv) {
            ctx.rewritten_argv = Some(rewritten);
        }
        if ctx.macos_argv_emulation {
            let mut argv = ctx
                .rewritten_argv
                .take()
                .unwrap_or_else(|| ctx.argv.clone());
            crate::apple_events::run_argv_emulation(&ctx.log, &mut argv);
            ctx.rewritten_argv = Some(argv);
        }
    }

    #[cfg(all(windows, not(feature = "windowed")))]
    match ctx.hide_console {
        HideConsole::HideLate => osutils::windows::hide_console(),
        HideConsole::MinimizeLate => osutils::windows::minimize_console(),
        _ => {}
    }

    #[cfg(all(windows, feature = "windowed"))]
    if ctx.splash.is_none() {
        osutils::windows::dismiss_startup_cursor();
    }

    debug!(ctx.log, "loading Python shared library");
    let libname = ctx.archive().python_libname().to_string();
    let version = ctx.archive().python_version();
    let dylib = DylibPython::load(&ctx.log, &ctx.application_home, &libname, version)?;
    ctx.dylib = Some(dylib);

    let exit_code = (|| -> Result<i32> {
        interpreter::start_interpreter(ctx)?;
        interpreter::import_bootstrap_modules(ctx)?;
        interpreter::install_pyz_hint(ctx)?;
        interpreter::run_entry_scripts(ctx)
    })();

    interpreter::finalize(ctx);

    // Directory builds own the splash screen in this process; tear it
    // down with the interpreter gone.
    if let Some(mut splash) = ctx.splash.take() {
        splash.finalize();
    }

    debug!(ctx.log, "end of process reached");
    exit_code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_table_single_file() {
        use {HomeDirAction as H, Platform as P, ProcessLevel as L};

        for platform in [P::Win32, P::Darwin, P::Cygwin] {
            assert_eq!(
                resolve_process_level(L::Unknown, true, true, platform).unwrap(),
                L::Parent
            );
            assert_eq!(
                resolve_process_level(L::Unknown, true, false, platform).unwrap(),
                L::Parent
            );
            assert!(resolve_process_level(L::ParentNeedsRestart, true, false, platform).is_err());
        }

        assert_eq!(
            resolve_process_level(L::Unknown, true, true, P::OtherPosix).unwrap(),
            L::ParentNeedsRestart
        );
        assert_eq!(
            resolve_process_level(L::Unknown, true, false, P::OtherPosix).unwrap(),
            L::Parent
        );
        assert_eq!(
            resolve_process_level(L::ParentNeedsRestart, true, false, P::OtherPosix).unwrap(),
            L::Parent
        );

        for platform in [P::Win32, P::Darwin, P::Cygwin, P::OtherPosix] {
            assert_eq!(
                resolve_process_level(L::Parent, true, false, platform).unwrap(),
                L::Main
            );
            assert_eq!(
                resolve_process_level(L::Main, true, false, platform).unwrap(),
                L::Subprocess
            );
            assert!(resolve_process_level(L::Subprocess, true, false, platform).is_err());
        }

        // Home-directory decisions along the same transitions.
        assert_eq!(
            onefile_home_action(L::Parent, L::Unknown),
            H::Create
        );
        assert_eq!(
            onefile_home_action(L::ParentNeedsRestart, L::Unknown),
            H::Create
        );
        assert_eq!(
            onefile_home_action(L::Parent, L::ParentNeedsRestart),
            H::Inherit
        );
        assert_eq!(onefile_home_action(L::Main, L::Parent), H::Inherit);
        assert_eq!(onefile_home_action(L::Subprocess, L::Main), H::Inherit);
    }

    #[test]
    fn role_table_directory_mode() {
        use {Platform as P, ProcessLevel as L};

        for platform in [P::Win32, P::Darwin, P::Cygwin] {
            assert_eq!(
                resolve_process_level(L::Unknown, false, false, platform).unwrap(),
                L::Main
            );
            assert!(
                resolve_process_level(L::ParentNeedsRestart, false, false, platform).is_err()
            );
        }

        assert_eq!(
            resolve_process_level(L::Unknown, false, false, P::OtherPosix).unwrap(),
            L::ParentNeedsRestart
        );
        assert_eq!(
            resolve_process_level(L::ParentNeedsRestart, false, false, P::OtherPosix).unwrap(),
            L::Main
        );
        assert_eq!(
            resolve_process_level(L::Main, false, false, P::OtherPosix).unwrap(),
            L::Subprocess
        );
    }

    #[test]
    fn onedir_root_derivation() {
        use Platform as P;

        assert_eq!(
            derive_onedir_root(Path::new("/opt/app/run"), None, P::OtherPosix),
            Path::new("/opt/app")
        );
        assert_eq!(
            derive_onedir_root(Path::new("/opt/app/run"), Some("_internal"), P::OtherPosix),
            Path::new("/opt/app/_internal")
        );
        assert_eq!(
            derive_onedir_root(
                Path::new("/Applications/My.app/Contents/MacOS/app"),
                None,
                P::Darwin
            ),
            Path::new("/Applications/My.app/Contents/Frameworks")
        );
        // The bundle pattern only re-anchors on darwin.
        assert_eq!(
            derive_onedir_root(
                Path::new("/data/My.app/Contents/MacOS/app"),
                None,
                P::OtherPosix
            ),
            Path::new("/data/My.app/Contents/MacOS")
        );
        // A bundle-like prefix elsewhere in the path must not trigger.
        assert_eq!(
            derive_onedir_root(
                Path::new("/Applications/My.app/Contents/MacOS/helpers/tool"),
                None,
                P::Darwin
            ),
            Path::new("/Applications/My.app/Contents/MacOS/helpers")
        );
    }

    #[test]
    fn sideload_naming() {
        assert_eq!(
            sideload_archive_path(Path::new("/opt/app/run"), Platform::OtherPosix),
            Path::new("/opt/app/run.pkg")
        );
        assert_eq!(
            sideload_archive_path(Path::new(r"C:\app\run.exe"), Platform::Win32),
            Path::new(r"C:\app\run.pkg")
        );
    }
}
