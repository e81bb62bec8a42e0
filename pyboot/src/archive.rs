// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client for the package archive appended to (or shipped beside) the
//! executable.
//!
//! The archive is an ordered sequence of typed entries, indexed by a
//! table of contents, with a fixed-size cookie trailer at the very end.
//! All framing integers are big-endian. This module only consumes the
//! container; producing it is the build toolchain's job.

use {
    crate::error::BootloaderError,
    byteorder::{BigEndian, ReadBytesExt},
    flate2::read::ZlibDecoder,
    std::{
        fs::File,
        io::{self, Read, Seek, SeekFrom},
        path::{Path, PathBuf},
    },
    thiserror::Error,
};

/// Cookie magic. The side-load marker is derived from this at run time
/// (byte 3 displaced by 0x0D) so that the marker pattern never appears
/// verbatim in the bootloader image itself.
const MAGIC_BASE: [u8; 8] = [b'M', b'E', b'I', 0x0C, 0x0B, 0x0A, 0x0B, 0x0E];

/// magic + archive length + TOC offset + TOC length + python version
/// + python shared library name.
const COOKIE_SIZE: u64 = 8 + 4 + 4 + 4 + 4 + 64;

/// Fixed-size prefix of a TOC record (everything but the name).
const TOC_RECORD_HEADER: u32 = 4 + 4 + 4 + 4 + 1 + 1;

/// Chunk size for magic-pattern scans over the file.
const SEARCH_CHUNK: usize = 8192;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("could not open {0}: {1}")]
    NotOpenable(PathBuf, io::Error),

    #[error("archive cookie not found")]
    MagicNotFound,

    #[error("table of contents exceeds archive bounds")]
    TocOutOfBounds,

    #[error("corrupt archive framing: {0}")]
    Framing(String),

    #[error("I/O error while reading archive: {0}")]
    Io(#[from] io::Error),
}

impl From<ArchiveError> for BootloaderError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::NotOpenable(path, io_err) => {
                BootloaderError::ArchiveNotFound(format!("{}: {}", path.display(), io_err))
            }
            other => BootloaderError::ArchiveFormat(other.to_string()),
        }
    }
}

/// Type codes of archive entries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryType {
    /// Marshalled code object of a bootstrap module.
    PyModule,
    /// Marshalled code object of a bootstrap package.
    PyPackage,
    /// The compressed Python module database.
    PyzArchive,
    /// A zip archive to be extracted as-is.
    ZipFile,
    /// A bootloader or interpreter runtime option.
    RuntimeOption,
    /// Marshalled code object of a user entry-point script.
    Script,
    /// A data file payload.
    Data,
    /// A shared library or other binary payload.
    Binary,
    /// A symbolic link; the payload is the link target.
    Symlink,
    /// A reference into another archive (multi-package builds).
    Dependency,
    /// Splash-screen resource bundle.
    SplashResources,
}

impl EntryType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            b'm' => Some(Self::PyModule),
            b'M' => Some(Self::PyPackage),
            b'z' => Some(Self::PyzArchive),
            b'Z' => Some(Self::ZipFile),
            b'o' => Some(Self::RuntimeOption),
            b's' => Some(Self::Script),
            b'x' => Some(Self::Data),
            b'b' => Some(Self::Binary),
            b'n' => Some(Self::Symlink),
            b'd' => Some(Self::Dependency),
            b'S' => Some(Self::SplashResources),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::PyModule => b'm',
            Self::PyPackage => b'M',
            Self::PyzArchive => b'z',
            Self::ZipFile => b'Z',
            Self::RuntimeOption => b'o',
            Self::Script => b's',
            Self::Data => b'x',
            Self::Binary => b'b',
            Self::Symlink => b'n',
            Self::Dependency => b'd',
            Self::SplashResources => b'S',
        }
    }

    /// Entries that are materialized into the application root when the
    /// archive is unpacked (single-file semantics).
    pub fn is_extractable(self) -> bool {
        matches!(
            self,
            Self::Binary | Self::Data | Self::ZipFile | Self::Symlink
        )
    }
}

/// A parsed TOC record. Names borrow from the archive's TOC buffer.
#[derive(Clone, Copy, Debug)]
pub struct TocEntry<'a> {
    pub type_code: EntryType,
    pub name: &'a str,
    /// Offset of the entry payload, relative to the start of the archive.
    pub offset: u32,
    pub compressed_length: u32,
    pub uncompressed_length: u32,
    pub compressed: bool,
}

/// An open package archive.
pub struct Archive {
    file: File,
    path: PathBuf,
    /// Offset of the archive inside the containing file: nonzero when
    /// embedded in the executable, zero for a side-loaded `.pkg`.
    pkg_offset: u64,
    /// Collected Python version as `100 * major + minor`.
    python_version: u16,
    /// File name of the collected Python shared library.
    python_libname: String,
    toc: Vec<u8>,
    contains_extractable_entries: bool,
    has_splash_resources: bool,
}

impl Archive {
    /// Open the archive contained in `path` (either an executable with
    /// an appended archive, or a bare `.pkg`).
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let mut file =
            File::open(path).map_err(|e| ArchiveError::NotOpenable(path.to_path_buf(), e))?;
        let file_size = file
            .metadata()
            .map_err(|e| ArchiveError::NotOpenable(path.to_path_buf(), e))?
            .len();

        if file_size < COOKIE_SIZE {
            return Err(ArchiveError::MagicNotFound);
        }

        let cookie_pos = find_pattern_backward(&mut file, file_size, &MAGIC_BASE)?
            .ok_or(ArchiveError::MagicNotFound)?;
        if cookie_pos + COOKIE_SIZE > file_size {
            return Err(ArchiveError::Framing(
                "cookie truncated at end of file".to_string(),
            ));
        }

        // Parse the cookie.
        file.seek(SeekFrom::Start(cookie_pos))?;
        let mut cookie = [0u8; COOKIE_SIZE as usize];
        file.read_exact(&mut cookie)?;

        let mut cursor = io::Cursor::new(&cookie[8..]);
        let archive_length = cursor.read_u32::<BigEndian>()? as u64;
        let toc_offset = cursor.read_u32::<BigEndian>()? as u64;
        let toc_length = cursor.read_u32::<BigEndian>()? as u64;
        let python_version = cursor.read_u32::<BigEndian>()?;

        let libname_raw = &cookie[24..88];
        let libname_end = libname_raw.iter().position(|&b| b == 0).unwrap_or(64);
        let python_libname = std::str::from_utf8(&libname_raw[..libname_end])
            .map_err(|_| ArchiveError::Framing("library name is not UTF-8".to_string()))?
            .to_string();

        let cookie_end = cookie_pos + COOKIE_SIZE;
        if archive_length < COOKIE_SIZE || archive_length > cookie_end {
            return Err(ArchiveError::Framing(format!(
                "archive length {} does not fit the file",
                archive_length
            )));
        }
        let pkg_offset = cookie_end - archive_length;

        // The TOC must lie fully between the archive start and the cookie.
        if toc_offset
            .checked_add(toc_length)
            .map(|end| end > archive_length - COOKIE_SIZE)
            .unwrap_or(true)
        {
            return Err(ArchiveError::TocOutOfBounds);
        }

        file.seek(SeekFrom::Start(pkg_offset + toc_offset))?;
        let mut toc = vec![0u8; toc_length as usize];
        file.read_exact(&mut toc)?;

        let python_version = u16::try_from(python_version)
            .map_err(|_| ArchiveError::Framing("implausible Python version".to_string()))?;

        let mut archive = Self {
            file,
            path: path.to_path_buf(),
            pkg_offset,
            python_version,
            python_libname,
            toc,
            contains_extractable_entries: false,
            has_splash_resources: false,
        };
        archive.validate_toc(archive_length)?;

        Ok(archive)
    }

    /// Walk the raw TOC once, checking every record against the archive
    /// bounds, and note archive-wide properties.
    fn validate_toc(&mut self, archive_length: u64) -> Result<(), ArchiveError> {
        let payload_limit = archive_length - COOKIE_SIZE;
        let mut pos = 0usize;

        while pos < self.toc.len() {
            let record = &self.toc[pos..];
            let mut cursor = io::Cursor::new(record);

            let entry_length = cursor
                .read_u32::<BigEndian>()
                .map_err(|_| ArchiveError::TocOutOfBounds)? as usize;
            if entry_length <= TOC_RECORD_HEADER as usize || entry_length > record.len() {
                return Err(ArchiveError::TocOutOfBounds);
            }

            let offset = cursor.read_u32::<BigEndian>()?;
            let compressed_length = cursor.read_u32::<BigEndian>()?;
            let _uncompressed_length = cursor.read_u32::<BigEndian>()?;
            let compression_flag = cursor.read_u8()?;
            let type_code = cursor.read_u8()?;

            if compression_flag > 1 {
                return Err(ArchiveError::Framing(format!(
                    "unknown compression flag {}",
                    compression_flag
                )));
            }

            let entry_type = EntryType::from_code(type_code).ok_or_else(|| {
                ArchiveError::Framing(format!("unknown TOC entry type {:#x}", type_code))
            })?;

            let payload_end = offset as u64 + compressed_length as u64;
            if payload_end > payload_limit {
                return Err(ArchiveError::TocOutOfBounds);
            }

            let name_raw = &record[TOC_RECORD_HEADER as usize..entry_length];
            let name_end = name_raw
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| ArchiveError::Framing("entry name not terminated".to_string()))?;
            std::str::from_utf8(&name_raw[..name_end])
                .map_err(|_| ArchiveError::Framing("entry name is not UTF-8".to_string()))?;

            if entry_type.is_extractable() {
                self.contains_extractable_entries = true;
            }
            if entry_type == EntryType::SplashResources {
                self.has_splash_resources = true;
            }

            pos += entry_length;
        }

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset of the archive inside the containing file. Nonzero when
    /// the archive is embedded in the executable.
    pub fn pkg_offset(&self) -> u64 {
        self.pkg_offset
    }

    pub fn python_version(&self) -> u16 {
        self.python_version
    }

    pub fn python_libname(&self) -> &str {
        &self.python_libname
    }

    pub fn contains_extractable_entries(&self) -> bool {
        self.contains_extractable_entries
    }

    pub fn has_splash_resources(&self) -> bool {
        self.has_splash_resources
    }

    /// Iterate the table of contents in archive order.
    pub fn toc_entries(&self) -> TocIter<'_> {
        TocIter {
            toc: &self.toc,
            pos: 0,
        }
    }

    /// Find the first TOC entry of the given type.
    pub fn find_entry(&self, entry_type: EntryType) -> Option<TocEntry<'_>> {
        self.toc_entries().find(|e| e.type_code == entry_type)
    }

    /// Extract an entry into a freshly allocated buffer of exactly its
    /// uncompressed length.
    pub fn extract(&self, entry: &TocEntry<'_>) -> Result<Vec<u8>, ArchiveError> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(self.pkg_offset + entry.offset as u64))?;

        let mut payload = vec![0u8; entry.compressed_length as usize];
        file.read_exact(&mut payload)?;

        if entry.compressed {
            let mut data = Vec::with_capacity(entry.uncompressed_length as usize);
            ZlibDecoder::new(payload.as_slice())
                .read_to_end(&mut data)
                .map_err(|e| ArchiveError::Framing(format!("{}: {}", entry.name, e)))?;
            if data.len() != entry.uncompressed_length as usize {
                return Err(ArchiveError::Framing(format!(
                    "{}: inflated to {} bytes, expected {}",
                    entry.name,
                    data.len(),
                    entry.uncompressed_length
                )));
            }
            Ok(data)
        } else {
            if payload.len() != entry.uncompressed_length as usize {
                return Err(ArchiveError::Framing(format!(
                    "{}: stored length mismatch",
                    entry.name
                )));
            }
            Ok(payload)
        }
    }
}

/// Forward iterator over the TOC. Records are variable-length (the name
/// is embedded), so each step advances by the record's self-declared
/// length. The TOC buffer was validated when the archive was opened.
pub struct TocIter<'a> {
    toc: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for TocIter<'a> {
    type Item = TocEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.toc.len() {
            return None;
        }

        let record = &self.toc[self.pos..];
        let mut cursor = io::Cursor::new(record);

        let entry_length = cursor.read_u32::<BigEndian>().ok()? as usize;
        let offset = cursor.read_u32::<BigEndian>().ok()?;
        let compressed_length = cursor.read_u32::<BigEndian>().ok()?;
        let uncompressed_length = cursor.read_u32::<BigEndian>().ok()?;
        let compression_flag = cursor.read_u8().ok()?;
        let type_code = cursor.read_u8().ok()?;

        let name_raw = record.get(TOC_RECORD_HEADER as usize..entry_length)?;
        let name_end = name_raw.iter().position(|&b| b == 0)?;
        let name = std::str::from_utf8(&name_raw[..name_end]).ok()?;

        self.pos += entry_length;

        Some(TocEntry {
            type_code: EntryType::from_code(type_code)?,
            name,
            offset,
            compressed_length,
            uncompressed_length,
            compressed: compression_flag != 0,
        })
    }
}

/// The side-load marker: the cookie magic with byte 3 displaced. Built
/// at run time so the bootloader image never contains the pattern.
pub fn sideload_marker() -> [u8; 8] {
    let mut marker = MAGIC_BASE;
    marker[3] += 0x0D;
    marker
}

/// Probe an executable for the side-load marker. Side-loading a `.pkg`
/// that sits next to the executable is permitted only when the marker
/// was placed into the executable at build time.
pub fn executable_allows_sideload(path: &Path) -> Result<bool, ArchiveError> {
    let mut file = File::open(path).map_err(|e| ArchiveError::NotOpenable(path.to_path_buf(), e))?;
    Ok(find_pattern_forward(&mut file, &sideload_marker())?.is_some())
}

/// Scan forward through a file for the first occurrence of `pattern`.
/// Chunks overlap by `pattern.len() - 1` bytes so matches straddling a
/// chunk boundary (including one ending at the very last byte of the
/// file) are found.
pub fn find_pattern_forward(file: &mut File, pattern: &[u8]) -> io::Result<Option<u64>> {
    assert!(!pattern.is_empty() && pattern.len() < SEARCH_CHUNK);

    file.seek(SeekFrom::Start(0))?;

    let mut buf = vec![0u8; SEARCH_CHUNK];
    let mut carry = 0usize;
    let mut base = 0u64;

    loop {
        let read = read_up_to(file, &mut buf[carry..])?;
        if read == 0 {
            return Ok(None);
        }
        let filled = carry + read;

        if let Some(at) = find_subslice(&buf[..filled], pattern) {
            return Ok(Some(base + at as u64));
        }

        // Keep the tail that could be a partial match.
        carry = pattern.len() - 1;
        if filled < carry {
            carry = filled;
        }
        buf.copy_within(filled - carry..filled, 0);
        base += (filled - carry) as u64;
    }
}

/// Scan backward from the end of a file for the last occurrence of
/// `pattern`; used to find the cookie, which trails every other use of
/// the pattern bytes in the file.
fn find_pattern_backward(
    file: &mut File,
    file_size: u64,
    pattern: &[u8],
) -> io::Result<Option<u64>> {
    assert!(!pattern.is_empty() && pattern.len() < SEARCH_CHUNK);

    let overlap = (pattern.len() - 1) as u64;
    let mut end = file_size;

    loop {
        let start = end.saturating_sub(SEARCH_CHUNK as u64);
        let len = (end - start) as usize;
        if len < pattern.len() {
            return Ok(None);
        }

        let mut buf = vec![0u8; len];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf)?;

        if let Some(at) = rfind_subslice(&buf, pattern) {
            return Ok(Some(start + at as u64));
        }

        if start == 0 {
            return Ok(None);
        }
        // Step back, overlapping so boundary-straddling matches are seen.
        end = start + overlap;
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn rfind_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testutil::{write_archive_file, ArchiveBuilder},
        std::io::Write,
    };

    #[test]
    fn open_bare_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.pkg");

        let builder = ArchiveBuilder::new(312, "libpython3.12.so.1.0")
            .entry(EntryType::RuntimeOption, "v", b"", false)
            .entry(EntryType::PyModule, "pyimod01_archive", b"marshal-data", true)
            .entry(EntryType::PyzArchive, "PYZ-00.pyz", b"pyz-payload", false);
        write_archive_file(&path, &builder.build(), b"");

        let archive = Archive::open(&path).unwrap();
        assert_eq!(archive.pkg_offset(), 0);
        assert_eq!(archive.python_version(), 312);
        assert_eq!(archive.python_libname(), "libpython3.12.so.1.0");
        assert!(!archive.contains_extractable_entries());

        let names: Vec<_> = archive.toc_entries().map(|e| e.name.to_string()).collect();
        assert_eq!(names, ["v", "pyimod01_archive", "PYZ-00.pyz"]);
    }

    #[test]
    fn open_embedded_archive_has_nonzero_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app");

        let builder = ArchiveBuilder::new(311, "libpython3.11.so.1.0")
            .entry(EntryType::Binary, "libfoo.so", b"elf-bytes", true);
        let prefix = vec![0xAAu8; 3000];
        write_archive_file(&path, &builder.build(), &prefix);

        let archive = Archive::open(&path).unwrap();
        assert_eq!(archive.pkg_offset(), 3000);
        assert!(archive.contains_extractable_entries());
    }

    #[test]
    fn extraction_round_trips_compressed_and_stored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.pkg");

        let payload = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let builder = ArchiveBuilder::new(310, "libpython3.10.so.1.0")
            .entry(EntryType::Data, "data/compressed.bin", &payload, true)
            .entry(EntryType::Data, "data/stored.bin", &payload, false);
        write_archive_file(&path, &builder.build(), b"");

        let archive = Archive::open(&path).unwrap();
        for entry in archive.toc_entries() {
            let data = archive.extract(&entry).unwrap();
            assert_eq!(data, payload, "mismatch for {}", entry.name);
            assert_eq!(data.len() as u32, entry.uncompressed_length);
        }
    }

    #[test]
    fn truncated_toc_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.pkg");

        let builder =
            ArchiveBuilder::new(312, "libpython3.12.so").entry(EntryType::Data, "x", b"abc", false);
        let mut image = builder.build();
        // Corrupt the first TOC record's self-declared length so it
        // overruns the TOC buffer.
        let toc_pos = image.toc_offset as usize;
        image.data[toc_pos..toc_pos + 4].copy_from_slice(&u32::MAX.to_be_bytes());
        write_archive_file(&path, &image, b"");

        match Archive::open(&path) {
            Err(ArchiveError::TocOutOfBounds) => {}
            other => panic!("expected TocOutOfBounds, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn missing_cookie_is_distinct_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("nope");
        assert!(matches!(
            Archive::open(&missing),
            Err(ArchiveError::NotOpenable(..))
        ));

        let plain = dir.path().join("plain");
        std::fs::write(&plain, vec![0u8; 4096]).unwrap();
        assert!(matches!(
            Archive::open(&plain),
            Err(ArchiveError::MagicNotFound)
        ));
    }

    #[test]
    fn sideload_marker_is_displaced_magic() {
        let marker = sideload_marker();
        assert_eq!(&marker[..3], b"MEI");
        assert_ne!(marker, MAGIC_BASE);
        assert_eq!(marker[3], MAGIC_BASE[3] + 0x0D);
    }

    #[test]
    fn sideload_probe_finds_marker_at_last_byte() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exe");

        let mut file = File::create(&path).unwrap();
        // Large enough to force several search chunks.
        file.write_all(&vec![0x55u8; SEARCH_CHUNK * 3 + 17]).unwrap();
        file.write_all(&sideload_marker()).unwrap();
        drop(file);

        assert!(executable_allows_sideload(&path).unwrap());
    }

    #[test]
    fn sideload_probe_rejects_unmarked_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exe");
        std::fs::write(&path, vec![0x55u8; 10000]).unwrap();
        assert!(!executable_allows_sideload(&path).unwrap());
    }

    #[test]
    fn marker_straddling_chunk_boundary_is_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exe");

        let mut body = vec![0u8; SEARCH_CHUNK - 3];
        body.extend_from_slice(&sideload_marker());
        body.extend_from_slice(&[0u8; 100]);
        std::fs::write(&path, &body).unwrap();

        assert!(executable_allows_sideload(&path).unwrap());
    }
}
