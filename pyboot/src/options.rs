// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parser for interpreter runtime options stored in the archive TOC.
//!
//! Options are TOC entries of type RUNTIME_OPTION whose *name* carries
//! the option text. Entries whose name starts with `pyi-` are
//! bootloader-private and read elsewhere; this module only produces the
//! record handed to the interpreter configurator.

use {
    crate::{
        archive::{Archive, EntryType},
        conversion::str_to_wide,
        error::{BootloaderError, Result},
    },
    libc::{c_ulong, wchar_t},
};

/// Encoding in which W- and X-flag lists are collected. The new init
/// protocol takes UTF-8 strings; the legacy protocol takes wide-char
/// strings. Exactly one of the two list pairs ends up populated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlagEncoding {
    Utf8,
    Wide,
}

/// Normalized runtime options collected from the archive.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuntimeOptions {
    /// Import trace verbosity; accumulated across `v` entries.
    pub verbose: i32,
    /// Unbuffered stdio (`u`).
    pub unbuffered: bool,
    /// Bytecode optimization level; accumulated across `O` entries.
    pub optimize: i32,

    pub use_hash_seed: bool,
    pub hash_seed: c_ulong,

    /// PEP 540 UTF-8 mode: -1 selects automatically based on locale.
    pub utf8_mode: i32,
    pub dev_mode: i32,

    /// W-flags in UTF-8 (new protocol) ...
    pub wflags: Vec<String>,
    /// ... or as NUL-terminated wide strings (legacy protocol).
    pub wflags_w: Vec<Vec<wchar_t>>,

    pub xflags: Vec<String>,
    pub xflags_w: Vec<Vec<wchar_t>>,
}

impl RuntimeOptions {
    pub fn num_wflags(&self) -> usize {
        self.wflags.len() + self.wflags_w.len()
    }

    pub fn num_xflags(&self) -> usize {
        self.xflags.len() + self.xflags_w.len()
    }
}

/// Match a `name`, `name=value`, or (for compatibility) `name value`
/// flag. Returns the value slice on a name match: empty when the flag
/// has no value, `None` when the name does not match.
fn match_key_value_flag<'a>(flag: &'a str, name: &str) -> Option<&'a str> {
    let rest = flag.strip_prefix(name)?;

    if rest.is_empty() {
        return Some(rest);
    }

    match rest.as_bytes()[0] {
        b'=' | b' ' => Some(&rest[1..]),
        _ => None,
    }
}

/// Parse an X-flag of the form `name`, `name=1`, `name=0` into its
/// destination: bare name or any value other than `0` enables.
fn match_and_parse_xflag(flag: &str, name: &str, dest: &mut i32) {
    if let Some(value) = match_key_value_flag(flag, name) {
        *dest = if value.is_empty() { 1 } else { i32::from(value != "0") };
    }
}

/// Walk the TOC and produce the normalized options record.
///
/// The TOC is walked twice: the first pass sets scalar options and
/// counts the W/X flags, the second collects the flag lists into arrays
/// sized from the first pass, in the requested encoding.
pub fn read_runtime_options(archive: &Archive, encoding: FlagEncoding) -> Result<RuntimeOptions> {
    let mut options = RuntimeOptions {
        // Default: auto-select based on locale.
        utf8_mode: -1,
        ..RuntimeOptions::default()
    };

    let mut num_wflags = 0usize;
    let mut num_xflags = 0usize;

    for entry in archive.toc_entries() {
        if entry.type_code != EntryType::RuntimeOption {
            continue;
        }

        let name = entry.name;

        // Bootloader-private options; not ours.
        if name.starts_with("pyi-") {
            continue;
        }

        if name == "v" || name == "verbose" {
            options.verbose += 1;
            continue;
        }

        if name == "u" || name == "unbuffered" {
            options.unbuffered = true;
            continue;
        }

        if name == "O" || name == "optimize" {
            options.optimize += 1;
            continue;
        }

        if name.starts_with("W ") {
            num_wflags += 1;
            continue;
        }

        if name.starts_with("X ") {
            num_xflags += 1;
            continue;
        }

        if let Some(value) = match_key_value_flag(name, "hash_seed") {
            if !value.is_empty() {
                options.hash_seed = value.parse::<c_ulong>().map_err(|_| {
                    BootloaderError::OptionsParse(format!("invalid hash seed: {:?}", value))
                })?;
                options.use_hash_seed = true;
            }
        }
    }

    // Collect W-flags and X-flags for pass-through, in the encoding the
    // active init protocol wants. The utf8/dev X-flags additionally
    // toggle pre-init fields and are therefore parsed here as well.
    match encoding {
        FlagEncoding::Utf8 => {
            options.wflags.reserve_exact(num_wflags);
            options.xflags.reserve_exact(num_xflags);
        }
        FlagEncoding::Wide => {
            options.wflags_w.reserve_exact(num_wflags);
            options.xflags_w.reserve_exact(num_xflags);
        }
    }

    for entry in archive.toc_entries() {
        if entry.type_code != EntryType::RuntimeOption {
            continue;
        }

        if let Some(flag) = entry.name.strip_prefix("W ") {
            match encoding {
                FlagEncoding::Utf8 => options.wflags.push(flag.to_string()),
                FlagEncoding::Wide => options.wflags_w.push(str_to_wide(flag)),
            }
        } else if let Some(flag) = entry.name.strip_prefix("X ") {
            match encoding {
                FlagEncoding::Utf8 => options.xflags.push(flag.to_string()),
                FlagEncoding::Wide => options.xflags_w.push(str_to_wide(flag)),
            }

            match_and_parse_xflag(flag, "utf8", &mut options.utf8_mode);
            match_and_parse_xflag(flag, "dev", &mut options.dev_mode);
        }
    }

    Ok(options)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            archive::Archive,
            testutil::{write_archive_file, ArchiveBuilder},
        },
        std::path::PathBuf,
    };

    fn archive_with_options(names: &[&str]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.pkg");

        let mut builder = ArchiveBuilder::new(312, "libpython3.12.so.1.0");
        for name in names {
            builder = builder.option(name);
        }
        write_archive_file(&path, &builder.build(), b"");
        (dir, path)
    }

    #[test]
    fn scalar_options() {
        let (_dir, path) = archive_with_options(&["v", "verbose", "u", "O", "hash_seed=12345"]);
        let archive = Archive::open(&path).unwrap();
        let options = read_runtime_options(&archive, FlagEncoding::Utf8).unwrap();

        assert_eq!(options.verbose, 2);
        assert!(options.unbuffered);
        assert_eq!(options.optimize, 1);
        assert!(options.use_hash_seed);
        assert_eq!(options.hash_seed, 12345);
        assert_eq!(options.utf8_mode, -1);
        assert_eq!(options.dev_mode, 0);
    }

    #[test]
    fn empty_toc_yields_default_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.pkg");
        write_archive_file(&path, &ArchiveBuilder::new(312, "lib").build(), b"");

        let archive = Archive::open(&path).unwrap();
        let options = read_runtime_options(&archive, FlagEncoding::Utf8).unwrap();
        assert_eq!(options.verbose, 0);
        assert!(!options.unbuffered);
        assert_eq!(options.utf8_mode, -1);
        assert_eq!(options.num_wflags(), 0);
        assert_eq!(options.num_xflags(), 0);
    }

    #[test]
    fn flag_lists_preserve_order_and_exclusivity() {
        let (_dir, path) = archive_with_options(&[
            "W ignore::DeprecationWarning",
            "X faulthandler",
            "W error::BytesWarning",
            "X importtime=1",
        ]);
        let archive = Archive::open(&path).unwrap();

        let utf8 = read_runtime_options(&archive, FlagEncoding::Utf8).unwrap();
        assert_eq!(
            utf8.wflags,
            ["ignore::DeprecationWarning", "error::BytesWarning"]
        );
        assert_eq!(utf8.xflags, ["faulthandler", "importtime=1"]);
        assert!(utf8.wflags_w.is_empty() && utf8.xflags_w.is_empty());

        let wide = read_runtime_options(&archive, FlagEncoding::Wide).unwrap();
        assert!(wide.wflags.is_empty() && wide.xflags.is_empty());
        assert_eq!(wide.wflags_w.len(), 2);
        assert_eq!(wide.xflags_w.len(), 2);
        assert_eq!(
            crate::conversion::wide_to_string(&wide.xflags_w[0]).unwrap(),
            "faulthandler"
        );
    }

    #[test]
    fn utf8_and_dev_xflag_aliases() {
        let (_dir, path) = archive_with_options(&["X utf8", "X dev=1"]);
        let archive = Archive::open(&path).unwrap();
        let options = read_runtime_options(&archive, FlagEncoding::Utf8).unwrap();
        assert_eq!(options.utf8_mode, 1);
        assert_eq!(options.dev_mode, 1);
        // The aliases still pass through as regular X-flags.
        assert_eq!(options.xflags, ["utf8", "dev=1"]);

        let (_dir, path) = archive_with_options(&["X utf8=0"]);
        let archive = Archive::open(&path).unwrap();
        let options = read_runtime_options(&archive, FlagEncoding::Utf8).unwrap();
        assert_eq!(options.utf8_mode, 0);

        // Prefix of a longer name must not match.
        let (_dir, path) = archive_with_options(&["X utf8_something"]);
        let archive = Archive::open(&path).unwrap();
        let options = read_runtime_options(&archive, FlagEncoding::Utf8).unwrap();
        assert_eq!(options.utf8_mode, -1);
    }

    #[test]
    fn bootloader_private_options_are_skipped() {
        let (_dir, path) = archive_with_options(&[
            "pyi-runtime-tmpdir /var/tmp",
            "pyi-bootloader-ignore-signals",
            "v",
        ]);
        let archive = Archive::open(&path).unwrap();
        let options = read_runtime_options(&archive, FlagEncoding::Utf8).unwrap();
        assert_eq!(options.verbose, 1);
        assert_eq!(options.num_wflags(), 0);
        assert_eq!(options.num_xflags(), 0);
    }

    #[test]
    fn invalid_hash_seed_is_an_error() {
        let (_dir, path) = archive_with_options(&["hash_seed=not-a-number"]);
        let archive = Archive::open(&path).unwrap();
        assert!(matches!(
            read_runtime_options(&archive, FlagEncoding::Utf8),
            Err(BootloaderError::OptionsParse(_))
        ));
    }

    #[test]
    fn reparsing_is_bitwise_stable() {
        let (_dir, path) = archive_with_options(&[
            "v",
            "u",
            "W default",
            "X utf8",
            "hash_seed=42",
        ]);
        let archive = Archive::open(&path).unwrap();

        let first = read_runtime_options(&archive, FlagEncoding::Wide).unwrap();
        let second = read_runtime_options(&archive, FlagEncoding::Wide).unwrap();
        assert_eq!(first, second);
    }
}
