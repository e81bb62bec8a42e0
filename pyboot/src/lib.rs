// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Run-time bootloader for self-contained frozen Python applications.

A frozen application is a native executable with a package archive
appended to it (or shipped beside it): bootstrap code objects, a
compressed Python module database, resource files, and runtime options.
This crate is the program that runs before Python exists: it finds the
archive, materializes the application root directory (extracting to an
ephemeral per-run directory in single-file mode), loads whatever Python
shared library was collected at build time, configures and starts the
interpreter, and hands control to the bundled entry-point scripts,
while orchestrating the two-process launcher/child split, splash-screen
lifecycle, signal forwarding, and the cleanup that single-file mode
needs.
*/

pub mod apple_events;
pub mod archive;
pub mod bootloader;
pub mod context;
pub mod conversion;
pub mod dylib;
pub mod error;
pub mod interpreter;
pub mod interpreter_config;
pub mod logging;
pub mod options;
pub mod osutils;
pub mod splash;

#[doc(hidden)]
pub mod testutil;

pub use crate::{
    bootloader::run,
    error::{BootloaderError, Result},
};
