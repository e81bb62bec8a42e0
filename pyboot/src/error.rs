// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types surfaced by the bootloader.

use {std::path::PathBuf, thiserror::Error};

/// Errors that can occur while bootstrapping a frozen application.
///
/// Every fallible bootloader operation resolves to one of these kinds.
/// The orchestrator translates any of them into a nonzero exit code and
/// a single human-readable message on the configured error channel.
#[derive(Debug, Error)]
pub enum BootloaderError {
    /// The package archive could not be located or opened.
    #[error("could not open package archive: {0}")]
    ArchiveNotFound(String),

    /// The package archive exists but its framing is invalid.
    #[error("invalid package archive: {0}")]
    ArchiveFormat(String),

    /// A runtime-option entry in the archive could not be parsed.
    #[error("could not parse run-time options: {0}")]
    OptionsParse(String),

    /// The Python shared library could not be loaded.
    #[error("could not load Python shared library {library}: {reason}")]
    DynLibLoad { library: PathBuf, reason: String },

    /// A required symbol is missing from the loaded shared library.
    #[error("could not bind symbol {0} from Python shared library")]
    SymbolMissing(&'static str),

    /// No configuration layout is known for the collected Python version.
    #[error("unsupported Python version: {major}.{minor}")]
    UnsupportedPythonVersion { major: u16, minor: u16 },

    /// Interpreter configuration was rejected by the runtime.
    #[error("interpreter configuration failed during {context}: {reason}")]
    ConfigFailure { context: &'static str, reason: String },

    /// Extracting an archive entry to the application root failed.
    #[error("could not extract {name}: {reason}")]
    ExtractionFailure { name: String, reason: String },

    /// The child process of a single-file build could not be started.
    #[error("could not spawn child process: {0}")]
    ChildSpawnFailure(String),

    /// Removing the ephemeral application directory failed in strict mode.
    #[error("could not clean up application directory {0}")]
    CleanupFailure(PathBuf),

    /// An inherited bootloader environment variable holds a bogus value.
    #[error("corrupted bootloader environment: {0}")]
    EnvironmentCorrupted(String),

    /// An OS primitive failed (path resolution, process control, ...).
    #[error("{context}: {reason}")]
    PlatformFailure { context: &'static str, reason: String },
}

impl BootloaderError {
    /// Shorthand for platform failures carrying an `io::Error`.
    pub fn platform(context: &'static str, err: std::io::Error) -> Self {
        Self::PlatformFailure {
            context,
            reason: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BootloaderError>;
