// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-version layout replicas of the legacy init-config structure.
//!
//! The legacy protocol requires the embedder to allocate the config
//! structure and write several fields directly, but the structure has no
//! stable layout across minor versions (nor between regular and
//! GIL-disabled builds of 3.13). One `#[repr(C)]` replica per supported
//! layout reproduces the original definitions from the runtime's
//! `initconfig.h`; fields guarded by `MS_WINDOWS` there are guarded by
//! `cfg(windows)` here. The configurator never touches the replicas
//! directly; it writes through a [PyConfigLayout] descriptor of field
//! offsets, selected by `(version << 1) | gil_flag`.

#![allow(dead_code)]

use {
    crate::dylib::PyWideStringList,
    libc::{c_int, c_ulong, wchar_t},
    std::mem::{offset_of, size_of},
};

/// Offsets (in bytes) of the config fields the bootloader writes, plus
/// the total structure size. One descriptor exists per supported
/// (version, gil-flag) layout.
#[derive(Debug)]
pub struct PyConfigLayout {
    pub size: usize,

    pub dev_mode: usize,
    pub install_signal_handlers: usize,
    pub use_hash_seed: usize,
    pub hash_seed: usize,
    pub argv: usize,
    pub program_name: usize,
    pub xoptions: usize,
    pub warnoptions: usize,
    pub site_import: usize,
    pub optimization_level: usize,
    pub write_bytecode: usize,
    pub verbose: usize,
    pub configure_c_stdio: usize,
    pub buffered_stdio: usize,
    pub home: usize,
    pub module_search_paths_set: usize,
    pub module_search_paths: usize,
}

macro_rules! describe_layout {
    ($config:ty) => {
        PyConfigLayout {
            size: size_of::<$config>(),
            dev_mode: offset_of!($config, dev_mode),
            install_signal_handlers: offset_of!($config, install_signal_handlers),
            use_hash_seed: offset_of!($config, use_hash_seed),
            hash_seed: offset_of!($config, hash_seed),
            argv: offset_of!($config, argv),
            program_name: offset_of!($config, program_name),
            xoptions: offset_of!($config, xoptions),
            warnoptions: offset_of!($config, warnoptions),
            site_import: offset_of!($config, site_import),
            optimization_level: offset_of!($config, optimization_level),
            write_bytecode: offset_of!($config, write_bytecode),
            verbose: offset_of!($config, verbose),
            configure_c_stdio: offset_of!($config, configure_c_stdio),
            buffered_stdio: offset_of!($config, buffered_stdio),
            home: offset_of!($config, home),
            module_search_paths_set: offset_of!($config, module_search_paths_set),
            module_search_paths: offset_of!($config, module_search_paths),
        }
    };
}

/// Select the layout descriptor for a runtime version. Returns `None`
/// for versions without a known layout, which callers surface as an
/// unsupported-version error before any interpreter call is made.
pub fn select_layout(version: u16, gil_disabled: bool) -> Option<&'static PyConfigLayout> {
    let id = (u32::from(version) << 1) | u32::from(gil_disabled);

    match id {
        id if id == layout_id(308, false) => Some(&LAYOUT_V38),
        id if id == layout_id(309, false) => Some(&LAYOUT_V39),
        id if id == layout_id(310, false) => Some(&LAYOUT_V310),
        id if id == layout_id(311, false) => Some(&LAYOUT_V311),
        id if id == layout_id(312, false) => Some(&LAYOUT_V312),
        id if id == layout_id(313, false) => Some(&LAYOUT_V313),
        id if id == layout_id(313, true) => Some(&LAYOUT_V313_GIL_DISABLED),
        _ => None,
    }
}

const fn layout_id(version: u16, gil_disabled: bool) -> u32 {
    (version as u32) << 1 | gil_disabled as u32
}

static LAYOUT_V38: PyConfigLayout = describe_layout!(PyConfigV38);
static LAYOUT_V39: PyConfigLayout = describe_layout!(PyConfigV39);
static LAYOUT_V310: PyConfigLayout = describe_layout!(PyConfigV310);
static LAYOUT_V311: PyConfigLayout = describe_layout!(PyConfigV311);
static LAYOUT_V312: PyConfigLayout = describe_layout!(PyConfigV312);
static LAYOUT_V313: PyConfigLayout = describe_layout!(PyConfigV313);
static LAYOUT_V313_GIL_DISABLED: PyConfigLayout = describe_layout!(PyConfigV313GilDisabled);

#[repr(C)]
pub struct PyConfigV38 {
    pub _config_init: c_int,
    pub isolated: c_int,
    pub use_environment: c_int,
    pub dev_mode: c_int,
    pub install_signal_handlers: c_int,
    pub use_hash_seed: c_int,
    pub hash_seed: c_ulong,
    pub faulthandler: c_int,
    pub tracemalloc: c_int,
    pub import_time: c_int,
    pub show_ref_count: c_int,
    pub show_alloc_count: c_int,
    pub dump_refs: c_int,
    pub malloc_stats: c_int,
    pub filesystem_encoding: *mut wchar_t,
    pub filesystem_errors: *mut wchar_t,
    pub pycache_prefix: *mut wchar_t,
    pub parse_argv: c_int,
    pub argv: PyWideStringList,
    pub program_name: *mut wchar_t,
    pub xoptions: PyWideStringList,
    pub warnoptions: PyWideStringList,
    pub site_import: c_int,
    pub bytes_warning: c_int,
    pub inspect: c_int,
    pub interactive: c_int,
    pub optimization_level: c_int,
    pub parser_debug: c_int,
    pub write_bytecode: c_int,
    pub verbose: c_int,
    pub quiet: c_int,
    pub user_site_directory: c_int,
    pub configure_c_stdio: c_int,
    pub buffered_stdio: c_int,
    pub stdio_encoding: *mut wchar_t,
    pub stdio_errors: *mut wchar_t,
    #[cfg(windows)]
    pub legacy_windows_stdio: c_int,
    pub check_hash_pycs_mode: *mut wchar_t,

    pub pathconfig_warnings: c_int,
    pub pythonpath_env: *mut wchar_t,
    pub home: *mut wchar_t,

    pub module_search_paths_set: c_int,
    pub module_search_paths: PyWideStringList,
    pub executable: *mut wchar_t,
    pub base_executable: *mut wchar_t,
    pub prefix: *mut wchar_t,
    pub base_prefix: *mut wchar_t,
    pub exec_prefix: *mut wchar_t,
    pub base_exec_prefix: *mut wchar_t,

    pub skip_source_first_line: c_int,
    pub run_command: *mut wchar_t,
    pub run_filename: *mut wchar_t,
    pub run_module: *mut wchar_t,

    pub _install_importlib: c_int,
    pub _init_main: c_int,
}

#[repr(C)]
pub struct PyConfigV39 {
    pub _config_init: c_int,
    pub isolated: c_int,
    pub use_environment: c_int,
    pub dev_mode: c_int,
    pub install_signal_handlers: c_int,
    pub use_hash_seed: c_int,
    pub hash_seed: c_ulong,
    pub faulthandler: c_int,
    pub tracemalloc: c_int,
    pub import_time: c_int,
    pub show_ref_count: c_int,
    pub dump_refs: c_int,
    pub malloc_stats: c_int,
    pub filesystem_encoding: *mut wchar_t,
    pub filesystem_errors: *mut wchar_t,
    pub pycache_prefix: *mut wchar_t,
    pub parse_argv: c_int,
    pub _use_peg_parser: c_int,
    pub argv: PyWideStringList,
    pub program_name: *mut wchar_t,
    pub xoptions: PyWideStringList,
    pub warnoptions: PyWideStringList,
    pub site_import: c_int,
    pub bytes_warning: c_int,
    pub inspect: c_int,
    pub interactive: c_int,
    pub optimization_level: c_int,
    pub parser_debug: c_int,
    pub write_bytecode: c_int,
    pub verbose: c_int,
    pub quiet: c_int,
    pub user_site_directory: c_int,
    pub configure_c_stdio: c_int,
    pub buffered_stdio: c_int,
    pub stdio_encoding: *mut wchar_t,
    pub stdio_errors: *mut wchar_t,
    #[cfg(windows)]
    pub legacy_windows_stdio: c_int,
    pub check_hash_pycs_mode: *mut wchar_t,

    pub pathconfig_warnings: c_int,
    pub pythonpath_env: *mut wchar_t,
    pub home: *mut wchar_t,
    pub platlibdir: *mut wchar_t,

    pub module_search_paths_set: c_int,
    pub module_search_paths: PyWideStringList,
    pub executable: *mut wchar_t,
    pub base_executable: *mut wchar_t,
    pub prefix: *mut wchar_t,
    pub base_prefix: *mut wchar_t,
    pub exec_prefix: *mut wchar_t,
    pub base_exec_prefix: *mut wchar_t,

    pub skip_source_first_line: c_int,
    pub run_command: *mut wchar_t,
    pub run_filename: *mut wchar_t,
    pub run_module: *mut wchar_t,

    pub _install_importlib: c_int,
    pub _init_main: c_int,
    pub _isolated_interpreter: c_int,
    pub _orig_argv: PyWideStringList,
}

#[repr(C)]
pub struct PyConfigV310 {
    pub _config_init: c_int,
    pub isolated: c_int,
    pub use_environment: c_int,
    pub dev_mode: c_int,
    pub install_signal_handlers: c_int,
    pub use_hash_seed: c_int,
    pub hash_seed: c_ulong,
    pub faulthandler: c_int,
    pub tracemalloc: c_int,
    pub import_time: c_int,
    pub show_ref_count: c_int,
    pub dump_refs: c_int,
    pub malloc_stats: c_int,
    pub filesystem_encoding: *mut wchar_t,
    pub filesystem_errors: *mut wchar_t,
    pub pycache_prefix: *mut wchar_t,
    pub parse_argv: c_int,
    pub orig_argv: PyWideStringList,
    pub argv: PyWideStringList,
    pub program_name: *mut wchar_t,
    pub xoptions: PyWideStringList,
    pub warnoptions: PyWideStringList,
    pub site_import: c_int,
    pub bytes_warning: c_int,
    pub warn_default_encoding: c_int,
    pub inspect: c_int,
    pub interactive: c_int,
    pub optimization_level: c_int,
    pub parser_debug: c_int,
    pub write_bytecode: c_int,
    pub verbose: c_int,
    pub quiet: c_int,
    pub user_site_directory: c_int,
    pub configure_c_stdio: c_int,
    pub buffered_stdio: c_int,
    pub stdio_encoding: *mut wchar_t,
    pub stdio_errors: *mut wchar_t,
    #[cfg(windows)]
    pub legacy_windows_stdio: c_int,
    pub check_hash_pycs_mode: *mut wchar_t,

    pub pathconfig_warnings: c_int,
    pub pythonpath_env: *mut wchar_t,
    pub home: *mut wchar_t,
    pub platlibdir: *mut wchar_t,

    pub module_search_paths_set: c_int,
    pub module_search_paths: PyWideStringList,
    pub executable: *mut wchar_t,
    pub base_executable: *mut wchar_t,
    pub prefix: *mut wchar_t,
    pub base_prefix: *mut wchar_t,
    pub exec_prefix: *mut wchar_t,
    pub base_exec_prefix: *mut wchar_t,

    pub skip_source_first_line: c_int,
    pub run_command: *mut wchar_t,
    pub run_filename: *mut wchar_t,
    pub run_module: *mut wchar_t,

    pub _install_importlib: c_int,
    pub _init_main: c_int,
    pub _isolated_interpreter: c_int,
}

#[repr(C)]
pub struct PyConfigV311 {
    pub _config_init: c_int,
    pub isolated: c_int,
    pub use_environment: c_int,
    pub dev_mode: c_int,
    pub install_signal_handlers: c_int,
    pub use_hash_seed: c_int,
    pub hash_seed: c_ulong,
    pub faulthandler: c_int,
    pub tracemalloc: c_int,
    pub import_time: c_int,
    pub code_debug_ranges: c_int,
    pub show_ref_count: c_int,
    pub dump_refs: c_int,
    pub dump_refs_file: *mut wchar_t,
    pub malloc_stats: c_int,
    pub filesystem_encoding: *mut wchar_t,
    pub filesystem_errors: *mut wchar_t,
    pub pycache_prefix: *mut wchar_t,
    pub parse_argv: c_int,
    pub orig_argv: PyWideStringList,
    pub argv: PyWideStringList,
    pub xoptions: PyWideStringList,
    pub warnoptions: PyWideStringList,
    pub site_import: c_int,
    pub bytes_warning: c_int,
    pub warn_default_encoding: c_int,
    pub inspect: c_int,
    pub interactive: c_int,
    pub optimization_level: c_int,
    pub parser_debug: c_int,
    pub write_bytecode: c_int,
    pub verbose: c_int,
    pub quiet: c_int,
    pub user_site_directory: c_int,
    pub configure_c_stdio: c_int,
    pub buffered_stdio: c_int,
    pub stdio_encoding: *mut wchar_t,
    pub stdio_errors: *mut wchar_t,
    #[cfg(windows)]
    pub legacy_windows_stdio: c_int,
    pub check_hash_pycs_mode: *mut wchar_t,
    pub use_frozen_modules: c_int,
    pub safe_path: c_int,
    pub int_max_str_digits: c_int,

    pub pathconfig_warnings: c_int,
    pub program_name: *mut wchar_t,
    pub pythonpath_env: *mut wchar_t,
    pub home: *mut wchar_t,
    pub platlibdir: *mut wchar_t,

    pub module_search_paths_set: c_int,
    pub module_search_paths: PyWideStringList,
    pub stdlib_dir: *mut wchar_t,
    pub executable: *mut wchar_t,
    pub base_executable: *mut wchar_t,
    pub prefix: *mut wchar_t,
    pub base_prefix: *mut wchar_t,
    pub exec_prefix: *mut wchar_t,
    pub base_exec_prefix: *mut wchar_t,

    pub skip_source_first_line: c_int,
    pub run_command: *mut wchar_t,
    pub run_filename: *mut wchar_t,
    pub run_module: *mut wchar_t,

    pub _install_importlib: c_int,
    pub _init_main: c_int,
    pub _isolated_interpreter: c_int,
    pub _is_python_build: c_int,
    pub sys_path_0: *mut wchar_t,
}

#[repr(C)]
pub struct PyConfigV312 {
    pub _config_init: c_int,
    pub isolated: c_int,
    pub use_environment: c_int,
    pub dev_mode: c_int,
    pub install_signal_handlers: c_int,
    pub use_hash_seed: c_int,
    pub hash_seed: c_ulong,
    pub faulthandler: c_int,
    pub tracemalloc: c_int,
    pub perf_profiling: c_int,
    pub import_time: c_int,
    pub code_debug_ranges: c_int,
    pub show_ref_count: c_int,
    pub dump_refs: c_int,
    pub dump_refs_file: *mut wchar_t,
    pub malloc_stats: c_int,
    pub filesystem_encoding: *mut wchar_t,
    pub filesystem_errors: *mut wchar_t,
    pub pycache_prefix: *mut wchar_t,
    pub parse_argv: c_int,
    pub orig_argv: PyWideStringList,
    pub argv: PyWideStringList,
    pub xoptions: PyWideStringList,
    pub warnoptions: PyWideStringList,
    pub site_import: c_int,
    pub bytes_warning: c_int,
    pub warn_default_encoding: c_int,
    pub inspect: c_int,
    pub interactive: c_int,
    pub optimization_level: c_int,
    pub parser_debug: c_int,
    pub write_bytecode: c_int,
    pub verbose: c_int,
    pub quiet: c_int,
    pub user_site_directory: c_int,
    pub configure_c_stdio: c_int,
    pub buffered_stdio: c_int,
    pub stdio_encoding: *mut wchar_t,
    pub stdio_errors: *mut wchar_t,
    #[cfg(windows)]
    pub legacy_windows_stdio: c_int,
    pub check_hash_pycs_mode: *mut wchar_t,
    pub use_frozen_modules: c_int,
    pub safe_path: c_int,
    pub int_max_str_digits: c_int,

    pub pathconfig_warnings: c_int,
    pub program_name: *mut wchar_t,
    pub pythonpath_env: *mut wchar_t,
    pub home: *mut wchar_t,
    pub platlibdir: *mut wchar_t,

    pub module_search_paths_set: c_int,
    pub module_search_paths: PyWideStringList,
    pub stdlib_dir: *mut wchar_t,
    pub executable: *mut wchar_t,
    pub base_executable: *mut wchar_t,
    pub prefix: *mut wchar_t,
    pub base_prefix: *mut wchar_t,
    pub exec_prefix: *mut wchar_t,
    pub base_exec_prefix: *mut wchar_t,

    pub skip_source_first_line: c_int,
    pub run_command: *mut wchar_t,
    pub run_filename: *mut wchar_t,
    pub run_module: *mut wchar_t,

    pub _install_importlib: c_int,
    pub _init_main: c_int,
    pub _is_python_build: c_int,
    pub sys_path_0: *mut wchar_t,
}

macro_rules! pyconfig_v313_body {
    ($name:ident $(, $gil_field:ident)?) => {
        #[repr(C)]
        pub struct $name {
            pub _config_init: c_int,
            pub isolated: c_int,
            pub use_environment: c_int,
            pub dev_mode: c_int,
            pub install_signal_handlers: c_int,
            pub use_hash_seed: c_int,
            pub hash_seed: c_ulong,
            pub faulthandler: c_int,
            pub tracemalloc: c_int,
            pub perf_profiling: c_int,
            pub import_time: c_int,
            pub code_debug_ranges: c_int,
            pub show_ref_count: c_int,
            pub dump_refs: c_int,
            pub dump_refs_file: *mut wchar_t,
            pub malloc_stats: c_int,
            pub filesystem_encoding: *mut wchar_t,
            pub filesystem_errors: *mut wchar_t,
            pub pycache_prefix: *mut wchar_t,
            pub parse_argv: c_int,
            pub orig_argv: PyWideStringList,
            pub argv: PyWideStringList,
            pub xoptions: PyWideStringList,
            pub warnoptions: PyWideStringList,
            pub site_import: c_int,
            pub bytes_warning: c_int,
            pub warn_default_encoding: c_int,
            pub inspect: c_int,
            pub interactive: c_int,
            pub optimization_level: c_int,
            pub parser_debug: c_int,
            pub write_bytecode: c_int,
            pub verbose: c_int,
            pub quiet: c_int,
            pub user_site_directory: c_int,
            pub configure_c_stdio: c_int,
            pub buffered_stdio: c_int,
            pub stdio_encoding: *mut wchar_t,
            pub stdio_errors: *mut wchar_t,
            #[cfg(windows)]
            pub legacy_windows_stdio: c_int,
            pub check_hash_pycs_mode: *mut wchar_t,
            pub use_frozen_modules: c_int,
            pub safe_path: c_int,
            pub int_max_str_digits: c_int,
            pub cpu_count: c_int,
            $(pub $gil_field: c_int,)?

            pub pathconfig_warnings: c_int,
            pub program_name: *mut wchar_t,
            pub pythonpath_env: *mut wchar_t,
            pub home: *mut wchar_t,
            pub platlibdir: *mut wchar_t,

            pub module_search_paths_set: c_int,
            pub module_search_paths: PyWideStringList,
            pub stdlib_dir: *mut wchar_t,
            pub executable: *mut wchar_t,
            pub base_executable: *mut wchar_t,
            pub prefix: *mut wchar_t,
            pub base_prefix: *mut wchar_t,
            pub exec_prefix: *mut wchar_t,
            pub base_exec_prefix: *mut wchar_t,

            pub skip_source_first_line: c_int,
            pub run_command: *mut wchar_t,
            pub run_filename: *mut wchar_t,
            pub run_module: *mut wchar_t,

            pub _install_importlib: c_int,
            pub _init_main: c_int,
            pub _is_python_build: c_int,
            pub sys_path_0: *mut wchar_t,
        }
    };
}

pyconfig_v313_body!(PyConfigV313);
pyconfig_v313_body!(PyConfigV313GilDisabled, enable_gil);

#[cfg(test)]
mod tests {
    use super::*;

    const SUPPORTED: &[(u16, bool)] = &[
        (308, false),
        (309, false),
        (310, false),
        (311, false),
        (312, false),
        (313, false),
        (313, true),
    ];

    #[test]
    fn all_supported_layouts_resolve() {
        for &(version, gil) in SUPPORTED {
            assert!(
                select_layout(version, gil).is_some(),
                "missing layout for {} (gil_disabled: {})",
                version,
                gil
            );
        }
    }

    #[test]
    fn unsupported_versions_resolve_to_none() {
        assert!(select_layout(307, false).is_none());
        assert!(select_layout(314, false).is_none());
        assert!(select_layout(312, true).is_none());
        assert!(select_layout(0, false).is_none());
    }

    #[test]
    fn descriptors_stay_inside_the_structure() {
        for &(version, gil) in SUPPORTED {
            let layout = select_layout(version, gil).unwrap();
            for offset in [
                layout.dev_mode,
                layout.install_signal_handlers,
                layout.use_hash_seed,
                layout.hash_seed,
                layout.argv,
                layout.program_name,
                layout.xoptions,
                layout.warnoptions,
                layout.site_import,
                layout.optimization_level,
                layout.write_bytecode,
                layout.verbose,
                layout.configure_c_stdio,
                layout.buffered_stdio,
                layout.home,
                layout.module_search_paths_set,
                layout.module_search_paths,
            ] {
                assert!(offset + size_of::<usize>() <= layout.size);
            }
        }
    }

    #[test]
    fn descriptor_field_relationships_hold() {
        for &(version, gil) in SUPPORTED {
            let layout = select_layout(version, gil).unwrap();
            // hash_seed directly follows its enable flag.
            assert!(layout.hash_seed > layout.use_hash_seed);
            // The search-path list follows its "was set" flag.
            assert!(layout.module_search_paths > layout.module_search_paths_set);
            // The scalar option block keeps its declaration order.
            assert!(layout.optimization_level > layout.site_import);
            assert!(layout.buffered_stdio > layout.configure_c_stdio);
        }
    }

    #[test]
    fn gil_disabled_variant_is_distinct() {
        let regular = select_layout(313, false).unwrap();
        let nogil = select_layout(313, true).unwrap();
        // The extra field sits before the path-configuration block, so
        // everything from there on shifts.
        assert!(nogil.program_name >= regular.program_name);
        assert!(nogil.home >= regular.home);
        assert_ne!(
            offset_of!(PyConfigV313GilDisabled, enable_gil),
            offset_of!(PyConfigV313GilDisabled, cpu_count)
        );
    }
}
