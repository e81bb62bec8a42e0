// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! String conversions between the three encodings the bootloader has to
//! juggle: win32 wide-char (UTF-16), POSIX locale-encoded bytes, and
//! UTF-8. No other module touches encoding directly.

use {
    crate::{
        dylib::DylibPython,
        error::{BootloaderError, Result},
    },
    libc::wchar_t,
    std::ffi::{CString, OsStr},
};

/// Encode a `str` as a NUL-terminated `wchar_t` buffer.
///
/// `wchar_t` is UTF-16 on Windows and UTF-32 elsewhere.
#[cfg(windows)]
pub fn str_to_wide(value: &str) -> Vec<wchar_t> {
    value
        .encode_utf16()
        .chain(std::iter::once(0))
        .map(|unit| unit as wchar_t)
        .collect()
}

#[cfg(not(windows))]
pub fn str_to_wide(value: &str) -> Vec<wchar_t> {
    value
        .chars()
        .map(|ch| ch as u32 as wchar_t)
        .chain(std::iter::once(0))
        .collect()
}

/// Decode a NUL-terminated or exact-length `wchar_t` buffer into a
/// `String`, folding UTF-16 surrogate pairs where `wchar_t` is 16-bit.
/// Returns `None` when the buffer holds invalid code points.
pub fn wide_to_string(units: &[wchar_t]) -> Option<String> {
    let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
    let units = &units[..end];

    let mut out = String::with_capacity(units.len());
    let mut i = 0;
    while i < units.len() {
        let mut ch = units[i] as u32;
        i += 1;

        // Surrogate pairs only occur with 16-bit wchar_t; with UTF-32
        // these code points are invalid and rejected below.
        if (0xD800..=0xDBFF).contains(&ch) && i < units.len() {
            let next = units[i] as u32;
            if (0xDC00..=0xDFFF).contains(&next) {
                ch = 0x10000 + (((ch & 0x03FF) << 10) | (next & 0x03FF));
                i += 1;
            }
        }

        out.push(char::from_u32(ch)?);
    }

    Some(out)
}

/// Convert an `OsStr` to a NUL-terminated C string in the platform's
/// native 8-bit encoding (raw bytes on POSIX, UTF-8 on Windows).
pub fn osstr_to_cstring(value: &OsStr) -> Result<CString> {
    #[cfg(unix)]
    let bytes = std::os::unix::ffi::OsStrExt::as_bytes(value).to_vec();

    #[cfg(windows)]
    let bytes = value
        .to_str()
        .ok_or_else(|| BootloaderError::PlatformFailure {
            context: "string conversion",
            reason: format!("{:?} is not valid Unicode", value),
        })?
        .as_bytes()
        .to_vec();

    CString::new(bytes).map_err(|_| BootloaderError::PlatformFailure {
        context: "string conversion",
        reason: format!("{:?} contains an embedded NUL", value),
    })
}

/// Convert a locale-encoded `OsStr` to UTF-8 using the loaded runtime's
/// own `Py_DecodeLocale`, which honors the locale configured during
/// interpreter pre-initialization. On Windows the input is already
/// Unicode and is passed through.
pub fn locale_to_utf8(dylib: &DylibPython, value: &OsStr) -> Result<String> {
    #[cfg(windows)]
    {
        let _ = dylib;
        return value
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| BootloaderError::PlatformFailure {
                context: "string conversion",
                reason: format!("{:?} is not valid Unicode", value),
            });
    }

    #[cfg(not(windows))]
    {
        let native = osstr_to_cstring(value)?;

        let wide = unsafe { (dylib.common.py_decode_locale)(native.as_ptr(), std::ptr::null_mut()) };
        if wide.is_null() {
            return Err(BootloaderError::PlatformFailure {
                context: "string conversion",
                reason: format!("could not decode {:?} from locale encoding", value),
            });
        }

        let mut len = 0usize;
        while unsafe { *wide.add(len) } != 0 {
            len += 1;
        }
        let decoded = wide_to_string(unsafe { std::slice::from_raw_parts(wide, len) });

        unsafe { (dylib.common.py_mem_raw_free)(wide as *mut _) };

        decoded.ok_or_else(|| BootloaderError::PlatformFailure {
            context: "string conversion",
            reason: format!("could not transcode {:?} to UTF-8", value),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_round_trip_ascii() {
        let wide = str_to_wide("hello");
        assert_eq!(*wide.last().unwrap(), 0);
        assert_eq!(wide_to_string(&wide).unwrap(), "hello");
    }

    #[test]
    fn wide_round_trip_non_ascii() {
        for value in ["naïve", "日本語", "emoji \u{1F980} done"] {
            let wide = str_to_wide(value);
            assert_eq!(wide_to_string(&wide).unwrap(), value);
        }
    }

    #[test]
    fn wide_to_string_stops_at_nul() {
        let mut wide = str_to_wide("abc");
        wide.extend_from_slice(&str_to_wide("junk"));
        assert_eq!(wide_to_string(&wide).unwrap(), "abc");
    }

    #[test]
    fn cstring_rejects_embedded_nul() {
        assert!(osstr_to_cstring(OsStr::new("a\0b")).is_err());
        assert!(osstr_to_cstring(OsStr::new("plain")).is_ok());
    }
}
