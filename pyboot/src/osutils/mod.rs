// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! OS-specific primitives: executable resolution, temp directories,
//! extraction to disk, recursive deletion, library search paths, child
//! processes, and signal plumbing.

#[cfg(unix)]
pub mod posix;
#[cfg(windows)]
pub mod windows;

use {
    crate::{
        context::ProcessContext,
        error::{BootloaderError, Result},
    },
    slog::{debug, warn},
    std::{
        ffi::OsString,
        path::{Component, Path, PathBuf},
    },
};

/// Fully resolve this executable's path, following symbolic links.
/// Also detects launch through an explicit dynamic linker/loader (e.g.
/// `/lib64/ld-linux-x86-64.so.2 ./app`), in which case the loader path
/// is returned alongside so a process restart can go through it again.
pub fn resolve_executable(argv: &[OsString]) -> Result<(PathBuf, Option<PathBuf>)> {
    #[cfg(target_os = "linux")]
    {
        posix::resolve_executable_linux(argv)
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    {
        let exe = std::env::current_exe()
            .and_then(std::fs::canonicalize)
            .or_else(|_| posix::resolve_from_argv0(argv))
            .map_err(|e| BootloaderError::platform("resolving executable path", e))?;
        Ok((exe, None))
    }

    #[cfg(windows)]
    {
        let _ = argv;
        Ok((windows::resolve_executable()?, None))
    }
}

/// Create the ephemeral application directory for a single-file build,
/// restricted to the current user where the OS supports it. The
/// directory name carries the `_MEI` prefix the in-interpreter support
/// code looks for.
pub fn create_restricted_temp_dir(
    ctx: &mut ProcessContext,
    runtime_tmpdir: Option<&str>,
) -> Result<PathBuf> {
    let candidates: Vec<PathBuf> = match runtime_tmpdir {
        Some(dir) => vec![PathBuf::from(dir)],
        None => {
            let mut dirs: Vec<PathBuf> = ["TMPDIR", "TEMP", "TMP"]
                .iter()
                .filter_map(|var| std::env::var_os(var))
                .map(PathBuf::from)
                .collect();
            #[cfg(unix)]
            dirs.extend(
                ["/tmp", "/var/tmp", "/usr/tmp"]
                    .iter()
                    .map(PathBuf::from),
            );
            dirs
        }
    };

    for base in &candidates {
        if std::fs::create_dir_all(base).is_err() {
            continue;
        }

        #[cfg(unix)]
        let created = posix::make_private_temp_dir(base);

        #[cfg(windows)]
        let created = windows::make_private_temp_dir(base, ctx);

        match created {
            Ok(path) => {
                debug!(ctx.log, "created application directory: {}", path.display());
                return Ok(path);
            }
            Err(e) => {
                debug!(
                    ctx.log,
                    "candidate {} rejected: {}",
                    base.display(),
                    e
                );
            }
        }
    }

    Err(BootloaderError::PlatformFailure {
        context: "creating application directory",
        reason: "no usable temporary directory candidate".to_string(),
    })
}

/// Recursively remove the ephemeral application directory. On Windows a
/// failed removal gets one mitigation pass (locked-file grace period)
/// and a retry. Safe to call when the directory is already gone.
pub fn remove_directory_tree(log: &slog::Logger, path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        return Ok(());
    }

    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(first_error) => {
            #[cfg(windows)]
            {
                warn!(
                    log,
                    "removal of {} failed ({}); attempting mitigation",
                    path.display(),
                    first_error
                );
                windows::mitigate_locked_directory(path);
                return std::fs::remove_dir_all(path);
            }

            #[cfg(not(windows))]
            {
                let _ = log;
                Err(first_error)
            }
        }
    }
}

/// Resolve an archive entry name to its on-disk location under the
/// application root. Entry names are build-controlled, but a corrupted
/// or malicious archive must not be able to escape the root.
pub fn resolve_entry_path(root: &Path, name: &str) -> Result<PathBuf> {
    let relative = Path::new(name);

    let escapes = relative.is_absolute()
        || relative.components().any(|component| {
            matches!(component, Component::ParentDir | Component::Prefix(_) | Component::RootDir)
        });
    if escapes {
        return Err(BootloaderError::ExtractionFailure {
            name: name.to_string(),
            reason: "entry name escapes the application directory".to_string(),
        });
    }

    Ok(root.join(relative))
}

/// Write one extracted entry payload under the application root,
/// creating intermediate directories. Overwriting an existing file is
/// fatal in strict-unpack mode and a warning otherwise.
pub fn write_extracted_file(
    ctx: &ProcessContext,
    root: &Path,
    name: &str,
    data: &[u8],
) -> Result<()> {
    let dest = resolve_entry_path(root, name)?;

    check_overwrite(ctx, name, &dest)?;

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BootloaderError::ExtractionFailure {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
    }

    std::fs::write(&dest, data).map_err(|e| BootloaderError::ExtractionFailure {
        name: name.to_string(),
        reason: e.to_string(),
    })?;

    // Extracted files live in a user-private tree; shared libraries
    // among them must also be executable.
    #[cfg(unix)]
    posix::set_private_file_mode(&dest);

    Ok(())
}

/// Materialize a symbolic-link entry. On platforms without reliable
/// symlink support the entry is skipped with a warning.
pub fn create_extracted_symlink(
    ctx: &ProcessContext,
    root: &Path,
    name: &str,
    target: &[u8],
) -> Result<()> {
    let dest = resolve_entry_path(root, name)?;
    check_overwrite(ctx, name, &dest)?;

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BootloaderError::ExtractionFailure {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        let target = PathBuf::from(std::ffi::OsStr::from_bytes(target));
        std::os::unix::fs::symlink(&target, &dest).map_err(|e| {
            BootloaderError::ExtractionFailure {
                name: name.to_string(),
                reason: e.to_string(),
            }
        })?;
    }

    #[cfg(not(unix))]
    {
        let _ = target;
        warn!(ctx.log, "skipping symbolic link entry {}", name);
    }

    Ok(())
}

fn check_overwrite(ctx: &ProcessContext, name: &str, dest: &Path) -> Result<()> {
    if dest.symlink_metadata().is_ok() {
        if ctx.strict_unpack_mode {
            return Err(BootloaderError::ExtractionFailure {
                name: name.to_string(),
                reason: format!("would overwrite {}", dest.display()),
            });
        }
        warn!(ctx.log, "overwriting existing file {}", dest.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> ProcessContext {
        ProcessContext::new(crate::logging::root_logger(), vec![OsString::from("app")])
    }

    #[test]
    fn entry_paths_stay_under_the_root() {
        let root = Path::new("/opt/app");
        assert_eq!(
            resolve_entry_path(root, "lib/libfoo.so").unwrap(),
            Path::new("/opt/app/lib/libfoo.so")
        );

        assert!(resolve_entry_path(root, "../escape").is_err());
        assert!(resolve_entry_path(root, "a/../../escape").is_err());
        assert!(resolve_entry_path(root, "/etc/passwd").is_err());
    }

    #[test]
    fn extraction_creates_intermediate_directories() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context();

        write_extracted_file(&ctx, dir.path(), "deep/nested/file.bin", b"payload").unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("deep/nested/file.bin")).unwrap(),
            b"payload"
        );
    }

    #[test]
    fn strict_mode_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context();

        write_extracted_file(&ctx, dir.path(), "file.bin", b"one").unwrap();

        // Non-strict: overwrite succeeds with a warning.
        write_extracted_file(&ctx, dir.path(), "file.bin", b"two").unwrap();
        assert_eq!(std::fs::read(dir.path().join("file.bin")).unwrap(), b"two");

        ctx.strict_unpack_mode = true;
        assert!(matches!(
            write_extracted_file(&ctx, dir.path(), "file.bin", b"three"),
            Err(BootloaderError::ExtractionFailure { .. })
        ));
    }

    // Windows needs the process context to carry a security descriptor;
    // covered by the POSIX variant here.
    #[cfg(unix)]
    #[test]
    fn temp_dir_uses_runtime_override_and_mei_prefix() {
        let scratch = tempfile::tempdir().unwrap();
        let override_dir = scratch.path().join("runtime");
        let mut ctx = test_context();

        let created =
            create_restricted_temp_dir(&mut ctx, Some(override_dir.to_str().unwrap())).unwrap();
        assert!(created.starts_with(&override_dir));
        assert!(created
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("_MEI"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = created.metadata().unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }

        remove_directory_tree(&ctx.log, &created).unwrap();
        assert!(!created.exists());
        // Second cleanup is a no-op.
        remove_directory_tree(&ctx.log, &created).unwrap();
    }
}
