// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! POSIX implementations of the platform port: executable resolution,
//! private temp directories, library search path, in-place restart, and
//! the child-process lifecycle with signal forwarding.

use {
    crate::{
        context::{ProcessContext, ASYNC_STATE},
        conversion::osstr_to_cstring,
        error::{BootloaderError, Result},
    },
    libc::c_int,
    slog::debug,
    std::{
        ffi::{CString, OsString},
        io,
        os::unix::{ffi::OsStrExt, process::CommandExt, process::ExitStatusExt},
        path::{Path, PathBuf},
        process::Command,
        sync::atomic::Ordering,
    },
};

/// Name of the library search path environment variable.
pub const LIBRARY_PATH_VAR: &str = if cfg!(target_os = "aix") {
    "LIBPATH"
} else {
    "LD_LIBRARY_PATH"
};

#[cfg(target_os = "linux")]
pub fn resolve_executable_linux(argv: &[OsString]) -> Result<(PathBuf, Option<PathBuf>)> {
    // /proc points at the true file, fully canonicalized. Unless the
    // process was launched through an explicit ld.so, in which case the
    // link points at the loader and argv[0] is our only lead.
    if let Ok(exe) = std::fs::read_link("/proc/self/exe") {
        if is_dynamic_loader(&exe) {
            let fallback = resolve_from_argv0(argv)
                .map_err(|e| BootloaderError::platform("resolving executable path", e))?;
            return Ok((fallback, Some(exe)));
        }
        return Ok((exe, None));
    }

    let fallback = resolve_from_argv0(argv)
        .map_err(|e| BootloaderError::platform("resolving executable path", e))?;
    Ok((fallback, None))
}

/// Whether a path names the ld.so dynamic linker/loader: a basename of
/// the form `ld-<variant>.so.<N>` (e.g. `ld-linux-x86-64.so.2`,
/// `ld-musl-x86_64.so.1`).
pub fn is_dynamic_loader(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let Some(rest) = name.strip_prefix("ld-") else {
        return false;
    };
    let Some((variant, soversion)) = rest.split_once(".so.") else {
        return false;
    };

    !variant.is_empty() && !variant.contains('.') && soversion.parse::<u32>().is_ok()
}

/// Resolve the executable from argv[0]: canonicalize a path-ful value,
/// search `$PATH` for a bare program name.
pub fn resolve_from_argv0(argv: &[OsString]) -> io::Result<PathBuf> {
    let argv0 = argv
        .first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argv"))?;

    let candidate = Path::new(argv0);
    if candidate.components().count() > 1 {
        return std::fs::canonicalize(candidate);
    }

    if let Some(search_path) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&search_path) {
            let path = dir.join(candidate);
            if path.exists() {
                return std::fs::canonicalize(path);
            }
        }
    }

    // Last resort: resolve the name as-is and hope for the best.
    std::fs::canonicalize(candidate)
}

/// Create a `_MEIXXXXXX` directory under `base` via `mkdtemp`, which
/// yields owner-only (0700) permissions.
pub fn make_private_temp_dir(base: &Path) -> io::Result<PathBuf> {
    let template = base.join("_MEIXXXXXX");
    let template = CString::new(template.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in path"))?;
    let raw = template.into_raw();

    let result = unsafe { libc::mkdtemp(raw) };
    let template = unsafe { CString::from_raw(raw) };

    if result.is_null() {
        return Err(io::Error::last_os_error());
    }

    Ok(PathBuf::from(std::ffi::OsStr::from_bytes(
        template.as_bytes(),
    )))
}

/// Make an extracted file private to the user and executable, so that
/// bundled shared libraries and helper binaries work in place.
pub fn set_private_file_mode(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700));
}

/// Prepend `dir` to the library search path environment variable,
/// preserving any pre-existing value in `<VAR>_ORIG` so user processes
/// spawned by the application can restore it.
pub fn set_library_search_path(log: &slog::Logger, dir: &Path) -> Result<()> {
    prepend_path_env(LIBRARY_PATH_VAR, dir);
    debug!(
        log,
        "{} now starts with {}",
        LIBRARY_PATH_VAR,
        dir.display()
    );
    Ok(())
}

pub fn prepend_path_env(var: &str, dir: &Path) {
    match std::env::var_os(var) {
        Some(existing) if !existing.is_empty() => {
            std::env::set_var(format!("{}_ORIG", var), &existing);

            let mut paths = vec![dir.to_path_buf()];
            paths.extend(std::env::split_paths(&existing));
            if let Ok(joined) = std::env::join_paths(paths) {
                std::env::set_var(var, joined);
            }
        }
        _ => std::env::set_var(var, dir),
    }
}

/// Replace this process image with a fresh copy of the executable, so
/// environment changes (library search path) take effect. Prefers the
/// dynamic loader when the process was originally launched through one.
/// Returns only on failure.
pub fn restart_in_place(ctx: &ProcessContext) -> Result<()> {
    let argv: Vec<CString> = ctx
        .argv
        .iter()
        .map(|arg| osstr_to_cstring(arg))
        .collect::<Result<_>>()?;

    let (program, full_argv) = match &ctx.dynamic_loader {
        Some(loader) => {
            debug!(
                ctx.log,
                "restarting through dynamic loader {}",
                loader.display()
            );
            let mut v = vec![osstr_to_cstring(loader.as_os_str())?];
            v.push(osstr_to_cstring(ctx.executable.as_os_str())?);
            v.extend(argv.into_iter().skip(1));
            let program = v[0].clone();
            (program, v)
        }
        None => {
            debug!(ctx.log, "restarting via execvp");
            let program = osstr_to_cstring(ctx.executable.as_os_str())?;
            (program, argv)
        }
    };

    let mut argv_ptrs: Vec<*const libc::c_char> =
        full_argv.iter().map(|arg| arg.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    unsafe { libc::execvp(program.as_ptr(), argv_ptrs.as_ptr()) };

    // execvp returned, so it failed.
    Err(BootloaderError::PlatformFailure {
        context: "restarting process",
        reason: io::Error::last_os_error().to_string(),
    })
}

// Signals that keep their default disposition: the child-status signals
// (SIGCLD is an alias of SIGCHLD on the platforms that define it) and
// the terminal-stop signal.
fn is_exempt_signal(signum: c_int) -> bool {
    signum == libc::SIGCHLD || signum == libc::SIGTSTP
}

extern "C" fn forward_signal_to_child(signum: c_int) {
    if ASYNC_STATE.ignore_signals.load(Ordering::Acquire) {
        ASYNC_STATE.noop_count.fetch_add(1, Ordering::AcqRel);
        return;
    }

    ASYNC_STATE.last_signal.store(signum, Ordering::Release);

    let pid = ASYNC_STATE.child_pid.load(Ordering::Acquire);
    if pid <= 0 {
        ASYNC_STATE.noop_count.fetch_add(1, Ordering::AcqRel);
        return;
    }

    if unsafe { libc::kill(pid, signum) } == 0 {
        ASYNC_STATE.forwarded_count.fetch_add(1, Ordering::AcqRel);
    } else {
        ASYNC_STATE.forward_error_count.fetch_add(1, Ordering::AcqRel);
    }
}

/// Install the forwarding handler for every catchable signal except the
/// exempt set. With `ignore_signals` the handler stays installed but
/// swallows the signals instead of forwarding them.
fn install_signal_handlers(ignore_signals: bool) {
    ASYNC_STATE
        .ignore_signals
        .store(ignore_signals, Ordering::Release);

    for signum in 1..32 {
        if is_exempt_signal(signum) {
            continue;
        }

        // SIGKILL and SIGSTOP cannot be caught; sigaction just fails
        // for them and we move on.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = forward_signal_to_child as usize;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signum, &action, std::ptr::null_mut());
        }
    }
}

/// Spawn the main application process and wait for it, forwarding
/// signals in the meantime. Returns the child's exit code; when the
/// child died on a signal, records it on the context so the caller can
/// re-raise after cleanup.
pub fn spawn_and_wait_child(ctx: &mut ProcessContext) -> Result<i32> {
    install_signal_handlers(ctx.ignore_signals);

    let argv = ctx.effective_argv();
    let mut command = Command::new(&ctx.executable);
    if argv.len() > 1 {
        command.args(&argv[1..]);
    }
    if let Some(argv0) = argv.first() {
        command.arg0(argv0);
    }

    debug!(ctx.log, "spawning child process");
    let mut child = command
        .spawn()
        .map_err(|e| BootloaderError::ChildSpawnFailure(e.to_string()))?;

    ASYNC_STATE
        .child_pid
        .store(child.id() as i32, Ordering::Release);

    let status = child.wait().map_err(|e| BootloaderError::PlatformFailure {
        context: "waiting for child process",
        reason: e.to_string(),
    });

    ASYNC_STATE.child_pid.store(0, Ordering::Release);

    let status = status?;

    if let Some(signal) = status.signal() {
        debug!(ctx.log, "child terminated by signal {}", signal);
        ctx.child_signal = Some(signal);
        return Ok(-1);
    }

    Ok(status.code().unwrap_or(-1))
}

/// Re-raise a signal against this process, inheriting the child's exit
/// disposition. Runs strictly after cleanup.
pub fn reraise_signal(log: &slog::Logger, signum: i32) {
    debug!(log, "re-raising signal {}", signum);

    // Restore the default disposition first; the forwarding handler is
    // still installed and would otherwise swallow the raise.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signum, &action, std::ptr::null_mut());
        libc::raise(signum);
    }
}

/// Store this process's name into the environment for restarted /
/// child processes to restore (the name is lost across exec of a
/// symlinked executable).
#[cfg(target_os = "linux")]
pub fn store_process_name(log: &slog::Logger) {
    let mut name = [0u8; 16];
    if unsafe { libc::prctl(libc::PR_GET_NAME, name.as_mut_ptr()) } == 0 {
        let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        if let Ok(name) = std::str::from_utf8(&name[..end]) {
            debug!(log, "storing process name: {}", name);
            std::env::set_var("_PYI_LINUX_PROCESS_NAME", name);
        }
    }
}

#[cfg(target_os = "linux")]
pub fn restore_process_name(log: &slog::Logger) {
    if let Ok(name) = std::env::var("_PYI_LINUX_PROCESS_NAME") {
        if let Ok(c_name) = CString::new(name.as_str()) {
            debug!(log, "restoring process name: {}", name);
            // Failures are ignored; the name is cosmetic.
            unsafe { libc::prctl(libc::PR_SET_NAME, c_name.as_ptr()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::sync::Mutex};

    // Environment mutation must not interleave across tests.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn dynamic_loader_names() {
        assert!(is_dynamic_loader(Path::new("/lib64/ld-linux-x86-64.so.2")));
        assert!(is_dynamic_loader(Path::new("/lib/ld-musl-x86_64.so.1")));
        assert!(is_dynamic_loader(Path::new("ld-linux.so.2")));

        assert!(!is_dynamic_loader(Path::new("/opt/app/run")));
        assert!(!is_dynamic_loader(Path::new("libld-something.so.2")));
        assert!(!is_dynamic_loader(Path::new("ld-linux.so")));
        assert!(!is_dynamic_loader(Path::new("ld-weird.name.so.2")));
        assert!(!is_dynamic_loader(Path::new("ld-linux.so.x")));
    }

    #[test]
    fn prepend_path_env_preserves_original() {
        let _guard = ENV_LOCK.lock().unwrap();

        let var = "PYBOOT_TEST_SEARCH_PATH";
        std::env::remove_var(var);
        std::env::remove_var(format!("{}_ORIG", var));

        prepend_path_env(var, Path::new("/opt/app"));
        assert_eq!(std::env::var(var).unwrap(), "/opt/app");
        assert!(std::env::var_os(format!("{}_ORIG", var)).is_none());

        prepend_path_env(var, Path::new("/opt/other"));
        assert_eq!(std::env::var(var).unwrap(), "/opt/other:/opt/app");
        assert_eq!(std::env::var(format!("{}_ORIG", var)).unwrap(), "/opt/app");

        std::env::remove_var(var);
        std::env::remove_var(format!("{}_ORIG", var));
    }

    #[test]
    fn mkdtemp_creates_private_directory() {
        let scratch = tempfile::tempdir().unwrap();
        let created = make_private_temp_dir(scratch.path()).unwrap();

        assert!(created.is_dir());
        let name = created.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("_MEI"));
        assert_eq!(name.len(), "_MEIXXXXXX".len());
        // mkdtemp must have replaced the template placeholders.
        assert!(!name.ends_with("XXXXXX"));
    }

    #[test]
    fn resolve_from_argv0_with_explicit_path() {
        let exe = std::env::current_exe().unwrap();
        let argv = vec![exe.clone().into_os_string()];
        let resolved = resolve_from_argv0(&argv).unwrap();
        assert_eq!(resolved, std::fs::canonicalize(exe).unwrap());
    }
}
