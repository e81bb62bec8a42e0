// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration of the embedded interpreter.
//!
//! Pre-initialization goes through the version-stable `PyPreConfig`;
//! main configuration goes through one of two protocols, selected by the
//! symbols the loaded runtime exports: the legacy protocol with its
//! per-version structure layouts, or the new protocol with named
//! setters.

pub mod pep587;
pub mod pep587_layouts;
pub mod pep741;

use {
    crate::{
        dylib::{DylibPython, PyPreConfig},
        error::{BootloaderError, Result},
        options::RuntimeOptions,
    },
    std::path::{Path, PathBuf},
};

/// Pre-initialize the interpreter: apply the utf8/dev options, ask the
/// runtime to configure the process locale (so `locale.getlocale()`
/// reflects the user's environment), and run pre-init. Must happen
/// before any other interpreter call.
pub fn preinit(dylib: &DylibPython, options: &RuntimeOptions) -> Result<()> {
    let mut pre_config = PyPreConfig::zeroed();
    unsafe { (dylib.common.py_pre_config_init_isolated_config)(&mut pre_config) };

    pre_config.utf8_mode = options.utf8_mode;
    pre_config.dev_mode = options.dev_mode;
    pre_config.configure_locale = 1;

    let status = unsafe { (dylib.common.py_pre_initialize)(&pre_config) };
    if unsafe { (dylib.common.py_status_exception)(status) } != 0 {
        return Err(BootloaderError::ConfigFailure {
            context: "interpreter pre-initialization",
            reason: dylib.describe_status(&status),
        });
    }

    Ok(())
}

/// The module search paths of a frozen application, in order: the
/// standard-library zip, the native extension directory, and the
/// application root itself.
pub fn module_search_paths(home: &Path, major: u16, minor: u16) -> [PathBuf; 3] {
    [
        home.join("base_library.zip"),
        home.join(format!("python{}.{}", major, minor))
            .join("lib-dynload"),
        home.to_path_buf(),
    ]
}

#[cfg(test)]
mod tests {
    use {super::*, std::path::Path};

    #[test]
    fn search_paths_are_exactly_three_in_order() {
        let paths = module_search_paths(Path::new("/opt/app"), 3, 12);
        assert_eq!(paths[0], Path::new("/opt/app/base_library.zip"));
        assert_eq!(paths[1], Path::new("/opt/app/python3.12/lib-dynload"));
        assert_eq!(paths[2], Path::new("/opt/app"));
    }

    #[test]
    fn search_paths_follow_the_minor_version() {
        let paths = module_search_paths(Path::new("/x"), 3, 8);
        assert!(paths[1].to_string_lossy().contains("python3.8"));
    }
}
