// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-disk archive scenarios: embedded vs side-loaded containers and
//! extraction into an application root.

use {
    anyhow::Result,
    pyboot::{
        archive::{executable_allows_sideload, sideload_marker, Archive, EntryType},
        options::{read_runtime_options, FlagEncoding},
        testutil::{write_archive_file, ArchiveBuilder},
    },
    std::fs,
};

/// A side-loaded layout: executable with the marker but no archive,
/// sibling `.pkg` with the real container. The archive opens with a
/// zero package offset.
#[test]
fn sideload_layout_resolves() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let exe = dir.path().join("app");
    let mut exe_image = vec![0x90u8; 5000];
    exe_image.extend_from_slice(&sideload_marker());
    exe_image.extend_from_slice(&[0x90u8; 123]);
    fs::write(&exe, &exe_image)?;

    let pkg = dir.path().join("app.pkg");
    let image = ArchiveBuilder::new(312, "libpython3.12.so.1.0")
        .option("v")
        .entry(EntryType::PyzArchive, "PYZ-00.pyz", b"modules", true)
        .build();
    write_archive_file(&pkg, &image, b"");

    // The executable itself holds no archive, but permits side-load.
    assert!(Archive::open(&exe).is_err());
    assert!(executable_allows_sideload(&exe)?);

    let archive = Archive::open(&pkg)?;
    assert_eq!(archive.pkg_offset(), 0);
    assert_eq!(archive.path(), pkg.as_path());
    Ok(())
}

/// An executable without the marker must not fall back to a sibling
/// archive, even if one is present.
#[test]
fn sideload_requires_the_marker() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let exe = dir.path().join("app");
    fs::write(&exe, vec![0x90u8; 5000])?;

    assert!(!executable_allows_sideload(&exe)?);
    Ok(())
}

/// Embedded layout: the archive is appended to the executable image
/// and every entry round-trips through extraction.
#[test]
fn embedded_archive_extraction() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let exe = dir.path().join("app");

    let library = b"\x7fELF-shared-library-payload".repeat(64);
    let data = b"config = 1\n".to_vec();

    let image = ArchiveBuilder::new(311, "libpython3.11.so.1.0")
        .entry(EntryType::Binary, "libpython3.11.so.1.0", &library, true)
        .entry(EntryType::Data, "app/settings.py", &data, true)
        .entry(EntryType::PyModule, "pyimod01_archive", b"marshal", true)
        .entry(EntryType::PyzArchive, "PYZ-00.pyz", b"modules", false)
        .build();
    write_archive_file(&exe, &image, &vec![0x90u8; 70_000]);

    let archive = Archive::open(&exe)?;
    assert_eq!(archive.pkg_offset(), 70_000);
    assert_eq!(archive.python_version(), 311);
    assert_eq!(archive.python_libname(), "libpython3.11.so.1.0");
    assert!(archive.contains_extractable_entries());

    let root = dir.path().join("approot");
    fs::create_dir(&root)?;

    for entry in archive.toc_entries() {
        if !entry.type_code.is_extractable() {
            continue;
        }
        let payload = archive.extract(&entry)?;
        let dest = root.join(entry.name);
        fs::create_dir_all(dest.parent().unwrap())?;
        fs::write(&dest, &payload)?;
    }

    assert_eq!(fs::read(root.join("libpython3.11.so.1.0"))?, library);
    assert_eq!(fs::read(root.join("app/settings.py"))?, data);
    Ok(())
}

/// The PYZ location hint is anchored at the absolute in-file offset:
/// package offset plus the entry's archive-relative offset.
#[test]
fn pyz_offset_accounts_for_embedding() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let exe = dir.path().join("app");

    let image = ArchiveBuilder::new(312, "libpython3.12.so.1.0")
        .entry(EntryType::Data, "first", &[0u8; 500], false)
        .entry(EntryType::PyzArchive, "PYZ-00.pyz", b"modules", false)
        .build();
    write_archive_file(&exe, &image, &vec![0u8; 12_345]);

    let archive = Archive::open(&exe)?;
    let pyz = archive.find_entry(EntryType::PyzArchive).unwrap();

    assert_eq!(archive.pkg_offset() + u64::from(pyz.offset), 12_345 + 500);
    Ok(())
}

/// Runtime options parse identically no matter how often the TOC is
/// walked, and the flag lists stay in archive order.
#[test]
fn options_parse_is_stable_across_invocations() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pkg = dir.path().join("app.pkg");

    let image = ArchiveBuilder::new(313, "libpython3.13.so.1.0")
        .option("pyi-python-flag Py_GIL_DISABLED")
        .option("W ignore::DeprecationWarning")
        .option("v")
        .option("X frozen_modules=on")
        .option("u")
        .build();
    write_archive_file(&pkg, &image, b"");

    let archive = Archive::open(&pkg)?;
    let first = read_runtime_options(&archive, FlagEncoding::Utf8)?;
    let second = read_runtime_options(&archive, FlagEncoding::Utf8)?;

    assert_eq!(first, second);
    assert_eq!(first.wflags, ["ignore::DeprecationWarning"]);
    assert_eq!(first.xflags, ["frozen_modules=on"]);
    assert_eq!(first.verbose, 1);
    assert!(first.unbuffered);
    Ok(())
}
