// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logging and error-channel plumbing.
//!
//! The bootloader runs before any of the application's own logging
//! exists, so everything here writes to stderr (or, for windowed builds,
//! to the platform's message facility). Debug-level records reproduce
//! the launch trace that is invaluable when a frozen application fails
//! to come up on an end-user machine.

use slog::Drain;

/// A slog Drain that writes single-line records to stderr.
pub struct StderrDrain {
    /// Minimum level that is emitted.
    pub level: slog::Level,
}

impl Drain for StderrDrain {
    type Ok = ();
    type Err = std::io::Error;

    fn log(
        &self,
        record: &slog::Record,
        _values: &slog::OwnedKVList,
    ) -> Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(self.level) {
            eprintln!("[{}] {}", record.level().as_short_str(), record.msg());
        }
        Ok(())
    }
}

/// Construct the root logger for a bootloader process.
///
/// Debug builds emit the full launch trace; release builds stay quiet
/// unless `PYBOOT_DEBUG=1` is present in the environment.
pub fn root_logger() -> slog::Logger {
    let level = if cfg!(debug_assertions) || std::env::var_os("PYBOOT_DEBUG").is_some() {
        slog::Level::Debug
    } else {
        slog::Level::Warning
    };

    slog::Logger::root(StderrDrain { level }.fuse(), slog::o!())
}

/// Emit a fatal error message on the channel appropriate for this build
/// flavor: stderr for console builds, a native dialog on windowed win32
/// builds, syslog on windowed darwin builds.
pub fn emit_error_message(message: &str) {
    #[cfg(all(windows, feature = "windowed"))]
    {
        use std::os::windows::ffi::OsStrExt;

        let title: Vec<u16> = std::ffi::OsStr::new("Application startup error")
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        let text: Vec<u16> = std::ffi::OsStr::new(message)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        unsafe {
            winapi::um::winuser::MessageBoxW(
                std::ptr::null_mut(),
                text.as_ptr(),
                title.as_ptr(),
                winapi::um::winuser::MB_OK | winapi::um::winuser::MB_ICONERROR,
            );
        }
        return;
    }

    #[cfg(all(target_os = "macos", feature = "windowed"))]
    {
        if let Ok(text) = std::ffi::CString::new(message) {
            unsafe {
                libc::syslog(libc::LOG_ERR, b"%s\0".as_ptr() as *const _, text.as_ptr());
            }
        }
        return;
    }

    #[allow(unreachable_code)]
    {
        eprintln!("{}", message);
    }
}
