// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helpers for constructing synthetic package archives in tests.
//!
//! The build toolchain normally produces the container; tests need a
//! local producer so the client can be exercised against real bytes.

use {
    crate::archive::EntryType,
    flate2::{write::ZlibEncoder, Compression},
    std::{io::Write, path::Path},
};

const COOKIE_SIZE: usize = 88;
const TOC_RECORD_HEADER: usize = 18;

/// A fully framed archive image plus the framing facts tests care about.
pub struct ArchiveImage {
    pub data: Vec<u8>,
    pub toc_offset: u32,
    pub toc_length: u32,
}

struct PendingEntry {
    type_code: EntryType,
    name: String,
    payload: Vec<u8>,
    compress: bool,
}

/// Builds archives entry by entry, in insertion order.
pub struct ArchiveBuilder {
    python_version: u32,
    python_libname: String,
    entries: Vec<PendingEntry>,
}

impl ArchiveBuilder {
    pub fn new(python_version: u32, python_libname: &str) -> Self {
        Self {
            python_version,
            python_libname: python_libname.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn entry(mut self, type_code: EntryType, name: &str, payload: &[u8], compress: bool) -> Self {
        self.entries.push(PendingEntry {
            type_code,
            name: name.to_string(),
            payload: payload.to_vec(),
            compress,
        });
        self
    }

    /// Convenience for runtime-option entries, which carry no payload.
    pub fn option(self, name: &str) -> Self {
        self.entry(EntryType::RuntimeOption, name, b"", false)
    }

    pub fn build(self) -> ArchiveImage {
        let mut payloads = Vec::new();
        let mut toc = Vec::new();

        for entry in &self.entries {
            let offset = payloads.len() as u32;

            let stored = if entry.compress {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&entry.payload).unwrap();
                encoder.finish().unwrap()
            } else {
                entry.payload.clone()
            };
            payloads.extend_from_slice(&stored);

            // Name field is NUL-terminated and padded so the whole
            // record length is a multiple of 16.
            let name_bytes = entry.name.as_bytes();
            let mut entry_length = TOC_RECORD_HEADER + name_bytes.len() + 1;
            entry_length += (16 - entry_length % 16) % 16;

            toc.extend_from_slice(&(entry_length as u32).to_be_bytes());
            toc.extend_from_slice(&offset.to_be_bytes());
            toc.extend_from_slice(&(stored.len() as u32).to_be_bytes());
            toc.extend_from_slice(&(entry.payload.len() as u32).to_be_bytes());
            toc.push(u8::from(entry.compress));
            toc.push(entry.type_code.code());
            toc.extend_from_slice(name_bytes);
            toc.resize(toc.len() + (entry_length - TOC_RECORD_HEADER - name_bytes.len()), 0);
        }

        let toc_offset = payloads.len() as u32;
        let toc_length = toc.len() as u32;
        let archive_length = payloads.len() + toc.len() + COOKIE_SIZE;

        let mut data = payloads;
        data.extend_from_slice(&toc);

        // Cookie trailer.
        data.extend_from_slice(&[b'M', b'E', b'I', 0x0C, 0x0B, 0x0A, 0x0B, 0x0E]);
        data.extend_from_slice(&(archive_length as u32).to_be_bytes());
        data.extend_from_slice(&toc_offset.to_be_bytes());
        data.extend_from_slice(&toc_length.to_be_bytes());
        data.extend_from_slice(&self.python_version.to_be_bytes());
        let mut libname = [0u8; 64];
        let name_bytes = self.python_libname.as_bytes();
        libname[..name_bytes.len()].copy_from_slice(name_bytes);
        data.extend_from_slice(&libname);

        ArchiveImage {
            data,
            toc_offset,
            toc_length,
        }
    }
}

/// Build a splash resource bundle in the layout the splash lifecycle
/// parses: three NUL-padded 32-byte name fields, two big-endian u32
/// lengths, the script, and NUL-separated requirement names.
pub fn build_splash_payload(
    tcl_libname: &str,
    tk_libname: &str,
    tk_data_dir: &str,
    script: &[u8],
    requirements: &[&str],
) -> Vec<u8> {
    let mut payload = Vec::new();

    for name in [tcl_libname, tk_libname, tk_data_dir] {
        let mut field = [0u8; 32];
        field[..name.len()].copy_from_slice(name.as_bytes());
        payload.extend_from_slice(&field);
    }

    let mut requirements_raw = Vec::new();
    for requirement in requirements {
        requirements_raw.extend_from_slice(requirement.as_bytes());
        requirements_raw.push(0);
    }

    payload.extend_from_slice(&(script.len() as u32).to_be_bytes());
    payload.extend_from_slice(&(requirements_raw.len() as u32).to_be_bytes());
    payload.extend_from_slice(script);
    payload.extend_from_slice(&requirements_raw);

    payload
}

/// Write an archive image to disk, optionally preceded by filler bytes
/// standing in for the executable (embedded-archive layout).
pub fn write_archive_file(path: &Path, image: &ArchiveImage, prefix: &[u8]) {
    let mut contents = prefix.to_vec();
    contents.extend_from_slice(&image.data);
    std::fs::write(path, contents).unwrap();
}
