// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The process-wide bootloader context and its satellite types.

use {
    crate::{archive::Archive, dylib::DylibPython, error::BootloaderError, splash::SplashContext},
    std::{
        ffi::OsString,
        path::PathBuf,
        str::FromStr,
        sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering},
    },
};

/// This process's role in the parent/child/subprocess hierarchy.
///
/// Stored as a small signed integer so the value round-trips cleanly
/// through the `_PYI_PARENT_PROCESS_LEVEL` environment variable.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[repr(i8)]
pub enum ProcessLevel {
    /// Designates the *parent* level of a top-level / entry-point process
    /// (the environment variable was not set at all).
    Unknown = -2,
    /// A process that must re-exec itself for library search path
    /// changes to take effect (POSIX systems where the search path is an
    /// environment variable).
    ParentNeedsRestart = -1,
    /// The launcher process of a single-file application; unpacks the
    /// application and spawns the main process.
    Parent = 0,
    /// The main application process, which starts the interpreter and
    /// runs user code.
    Main = 1,
    /// A sub-process spawned from the main application process using the
    /// same executable (e.g., via `sys.executable`).
    Subprocess = 2,
}

impl ProcessLevel {
    pub fn as_i8(self) -> i8 {
        self as i8
    }

    pub fn from_i8(value: i8) -> Option<Self> {
        match value {
            -2 => Some(Self::Unknown),
            -1 => Some(Self::ParentNeedsRestart),
            0 => Some(Self::Parent),
            1 => Some(Self::Main),
            2 => Some(Self::Subprocess),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProcessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_i8())
    }
}

impl FromStr for ProcessLevel {
    type Err = BootloaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: i8 = s.parse().map_err(|_| {
            BootloaderError::EnvironmentCorrupted(format!(
                "invalid process level value: {:?}",
                s
            ))
        })?;

        Self::from_i8(value).ok_or_else(|| {
            BootloaderError::EnvironmentCorrupted(format!(
                "process level {} out of range",
                value
            ))
        })
    }
}

/// Host platform classification used by the role-resolution state
/// machine and the application-root derivation. Kept as a value (rather
/// than `cfg` branches) so the decision tables are testable on any host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Platform {
    /// Windows proper.
    Win32,
    /// macOS.
    Darwin,
    /// Cygwin: POSIX semantics, but the DLL search path is set with
    /// `SetDllDirectoryW()` like on Windows.
    Cygwin,
    /// Any other POSIX system (library search path is an environment
    /// variable, so processes may need to re-exec themselves).
    OtherPosix,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Win32
        } else if cfg!(target_os = "macos") {
            Platform::Darwin
        } else if cfg!(target_os = "cygwin") {
            Platform::Cygwin
        } else {
            Platform::OtherPosix
        }
    }

    /// Whether the library search path can be adjusted from within the
    /// running process (as opposed to requiring an environment variable
    /// and a restart/spawn).
    pub fn has_in_process_search_path(self) -> bool {
        matches!(self, Platform::Win32 | Platform::Darwin | Platform::Cygwin)
    }
}

/// Console hiding/minimization requests (`pyi-hide-console`). Acted on
/// only by win32 console builds; parsed everywhere so that the option
/// record stays portable.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum HideConsole {
    #[default]
    Unused,
    HideEarly,
    HideLate,
    MinimizeEarly,
    MinimizeLate,
}

impl HideConsole {
    pub fn from_option_value(value: &str) -> Self {
        match value {
            "hide-early" => Self::HideEarly,
            "hide-late" => Self::HideLate,
            "minimize-early" => Self::MinimizeEarly,
            "minimize-late" => Self::MinimizeLate,
            _ => Self::Unused,
        }
    }
}

/// Fields mutated from signal handlers and OS callbacks.
///
/// These are the only pieces of bootloader state written outside the
/// main control flow. Writers are async-signal contexts; the main flow
/// reads with acquire ordering.
pub struct AsyncState {
    /// Session/console shutdown was requested (win32 control handler or
    /// hidden-window procedure).
    pub shutdown_requested: AtomicBool,
    /// PID of the spawned child process; 0 when no child is alive.
    pub child_pid: AtomicI32,
    /// Last signal received by the forwarding handler; 0 when none.
    pub last_signal: AtomicI32,
    /// When set, the forwarding handler ignores signals instead of
    /// forwarding them (`pyi-bootloader-ignore-signals`).
    pub ignore_signals: AtomicBool,
    /// Forwarding statistics, kept for debug traces.
    pub forwarded_count: AtomicU32,
    pub forward_error_count: AtomicU32,
    pub noop_count: AtomicU32,
}

impl AsyncState {
    pub const fn new() -> Self {
        Self {
            shutdown_requested: AtomicBool::new(false),
            child_pid: AtomicI32::new(0),
            last_signal: AtomicI32::new(0),
            ignore_signals: AtomicBool::new(false),
            forwarded_count: AtomicU32::new(0),
            forward_error_count: AtomicU32::new(0),
            noop_count: AtomicU32::new(0),
        }
    }

    pub fn reset(&self) {
        self.shutdown_requested.store(false, Ordering::Release);
        self.child_pid.store(0, Ordering::Release);
        self.last_signal.store(0, Ordering::Release);
        self.ignore_signals.store(false, Ordering::Release);
        self.forwarded_count.store(0, Ordering::Release);
        self.forward_error_count.store(0, Ordering::Release);
        self.noop_count.store(0, Ordering::Release);
    }
}

/// The async-set record shared with signal handlers. Signal handlers
/// cannot receive user data, so this one statically allocated instance
/// is the designated rendezvous point; all other bootloader state lives
/// on the [ProcessContext] and is owned by the main flow exclusively.
pub static ASYNC_STATE: AsyncState = AsyncState::new();

/// Process-wide bookkeeping threaded through all bootloader components.
///
/// Created once by the entry point; fields are populated incrementally
/// as startup progresses. Each owned sub-resource (archive, splash
/// context, Python library handle) has exactly one owner and is released
/// on the single exit path of the role that allocated it.
pub struct ProcessContext {
    pub log: slog::Logger,

    /// Original command-line arguments, exactly as received.
    pub argv: Vec<OsString>,
    /// Rewritten arguments, when some codepath (e.g. the darwin argv
    /// filter) had to modify them. Consumers prefer this over `argv`
    /// when present.
    pub rewritten_argv: Option<Vec<OsString>>,

    /// Fully resolved path to this executable.
    pub executable: PathBuf,
    /// Path to the dynamic linker/loader when the executable was
    /// launched through one (e.g. `/lib64/ld-linux-x86-64.so.2 ./app`);
    /// a restart must then go through the same loader.
    pub dynamic_loader: Option<PathBuf>,

    /// Resolved archive path (the executable itself when embedded, the
    /// sibling `.pkg` when side-loaded).
    pub archive_path: PathBuf,
    pub archive: Option<Archive>,

    /// The archive carries extractable entries, i.e. the application has
    /// single-file semantics.
    pub is_onefile: bool,

    /// Splash-screen resources exist in the archive.
    pub has_splash: bool,
    /// The user suppressed the splash screen via environment variable.
    pub suppress_splash: bool,
    pub splash: Option<SplashContext>,

    pub process_level: ProcessLevel,
    pub parent_process_level: ProcessLevel,

    /// Application root directory (`sys._MEIPASS`): ephemeral in
    /// single-file mode, anchored at the executable in directory mode.
    pub application_home: PathBuf,

    pub dylib: Option<DylibPython>,

    /// Overwrite-during-extraction and cleanup failures become fatal.
    pub strict_unpack_mode: bool,

    // Owned copies of bootloader-private runtime options. The values
    // originate in the archive TOC but are copied out so their lifetime
    // is not tied to the archive handle.
    pub runtime_tmpdir: Option<String>,
    pub contents_subdirectory: Option<String>,
    pub hide_console: HideConsole,
    pub disable_windowed_traceback: bool,
    pub macos_argv_emulation: bool,
    pub ignore_signals: bool,
    /// The collected Python library was built with Py_GIL_DISABLED,
    /// which changes the legacy config structure layout.
    pub nogil_enabled: bool,

    /// Termination signal observed on the child (POSIX single-file
    /// parent); re-raised after cleanup so the shell sees the child's
    /// disposition.
    pub child_signal: Option<i32>,

    #[cfg(windows)]
    pub security_attributes: Option<crate::osutils::windows::SecurityAttributes>,
}

impl ProcessContext {
    pub fn new(log: slog::Logger, argv: Vec<OsString>) -> Self {
        Self {
            log,
            argv,
            rewritten_argv: None,
            executable: PathBuf::new(),
            dynamic_loader: None,
            archive_path: PathBuf::new(),
            archive: None,
            is_onefile: false,
            has_splash: false,
            suppress_splash: false,
            splash: None,
            process_level: ProcessLevel::Unknown,
            parent_process_level: ProcessLevel::Unknown,
            application_home: PathBuf::new(),
            dylib: None,
            strict_unpack_mode: false,
            runtime_tmpdir: None,
            contents_subdirectory: None,
            hide_console: HideConsole::Unused,
            disable_windowed_traceback: false,
            macos_argv_emulation: false,
            ignore_signals: false,
            nogil_enabled: false,
            child_signal: None,
            #[cfg(windows)]
            security_attributes: None,
        }
    }

    /// The archive handle; callable only after archive resolution.
    pub fn archive(&self) -> &Archive {
        self.archive
            .as_ref()
            .expect("archive accessed before resolution")
    }

    /// The Python library handle; callable only on the interpreter path.
    pub fn dylib(&self) -> &DylibPython {
        self.dylib
            .as_ref()
            .expect("Python library accessed before load")
    }

    /// Arguments to pass on: the rewritten copy when present, the
    /// original otherwise.
    pub fn effective_argv(&self) -> &[OsString] {
        match &self.rewritten_argv {
            Some(argv) => argv,
            None => &self.argv,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_level_env_round_trip() {
        for level in [
            ProcessLevel::Unknown,
            ProcessLevel::ParentNeedsRestart,
            ProcessLevel::Parent,
            ProcessLevel::Main,
            ProcessLevel::Subprocess,
        ] {
            let published = level.to_string();
            assert_eq!(published.parse::<ProcessLevel>().unwrap(), level);
        }
    }

    #[test]
    fn process_level_rejects_garbage() {
        assert!("".parse::<ProcessLevel>().is_err());
        assert!("3".parse::<ProcessLevel>().is_err());
        assert!("-3".parse::<ProcessLevel>().is_err());
        assert!("1x".parse::<ProcessLevel>().is_err());
    }

    #[test]
    fn hide_console_values() {
        assert_eq!(
            HideConsole::from_option_value("hide-early"),
            HideConsole::HideEarly
        );
        assert_eq!(
            HideConsole::from_option_value("minimize-late"),
            HideConsole::MinimizeLate
        );
        assert_eq!(
            HideConsole::from_option_value("bogus"),
            HideConsole::Unused
        );
    }

    #[test]
    fn async_state_reset() {
        ASYNC_STATE.child_pid.store(42, Ordering::Release);
        ASYNC_STATE.last_signal.store(15, Ordering::Release);
        ASYNC_STATE.reset();
        assert_eq!(ASYNC_STATE.child_pid.load(Ordering::Acquire), 0);
        assert_eq!(ASYNC_STATE.last_signal.load(Ordering::Acquire), 0);
    }
}
