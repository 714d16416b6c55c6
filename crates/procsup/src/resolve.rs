//! Executable lookup along a search path

use crate::request::SpawnRequest;
use procsup_core::{ProcessError, Result};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

#[cfg(windows)]
const DEFAULT_PATHEXT: &str = ".COM;.EXE;.BAT;.CMD";

/// Split a `PATH`-style value into directories. An empty entry means the
/// current directory.
pub fn search_dirs(path: &OsStr) -> Vec<PathBuf> {
    std::env::split_paths(path)
        .map(|dir| {
            if dir.as_os_str().is_empty() {
                PathBuf::from(".")
            } else {
                dir
            }
        })
        .collect()
}

/// Parse a `PATHEXT`-style list, dropping empty entries
pub fn parse_extensions(pathext: &OsStr) -> Vec<OsString> {
    pathext
        .to_string_lossy()
        .split(';')
        .filter(|ext| !ext.is_empty())
        .map(OsString::from)
        .collect()
}

/// Extensions probed after the literal name on this platform
pub fn platform_extensions() -> Vec<OsString> {
    #[cfg(windows)]
    {
        let pathext =
            std::env::var_os("PATHEXT").unwrap_or_else(|| OsString::from(DEFAULT_PATHEXT));
        parse_extensions(&pathext)
    }
    #[cfg(not(windows))]
    {
        Vec::new()
    }
}

/// True if `path` is a regular file the effective identity may execute,
/// the same check `execve` applies
#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use nix::fcntl::AtFlags;
    use nix::unistd::{AccessFlags, faccessat};

    path.is_file() && faccessat(None, path, AccessFlags::X_OK, AtFlags::AT_EACCESS).is_ok()
}

/// True if `path` exists as a file
#[cfg(windows)]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Every match for `name`, directory by directory. Within one directory the
/// literal name comes first, then each extension in list order.
pub fn which_all_with<F>(
    name: &OsStr,
    dirs: &[PathBuf],
    extensions: &[OsString],
    accept: F,
) -> Vec<PathBuf>
where
    F: Fn(&Path) -> bool,
{
    let mut found = Vec::new();
    for dir in dirs {
        let candidate = dir.join(name);
        if accept(&candidate) {
            found.push(candidate.clone());
        }
        for ext in extensions {
            let mut with_ext = candidate.clone().into_os_string();
            with_ext.push(ext);
            let with_ext = PathBuf::from(with_ext);
            if accept(&with_ext) {
                found.push(with_ext);
            }
        }
    }
    found
}

/// Every executable match for `name` in `dirs`
pub fn which_all(name: &OsStr, dirs: &[PathBuf]) -> Vec<PathBuf> {
    which_all_with(name, dirs, &platform_extensions(), is_executable)
}

/// First executable match for `name` in `dirs`
pub fn which(name: &OsStr, dirs: &[PathBuf]) -> Option<PathBuf> {
    which_all(name, dirs).into_iter().next()
}

fn has_separator(path: &Path) -> bool {
    path.to_string_lossy().contains(std::path::is_separator)
}

/// Resolve the executable of `request`.
///
/// A name containing a path separator is used verbatim; a bare name is
/// searched along the request's own `PATH`, or `default_path` when it has none.
pub fn resolve_executable(request: &SpawnRequest, default_path: &str) -> Result<PathBuf> {
    let executable = request.executable();
    if has_separator(executable) {
        return Ok(executable.to_path_buf());
    }

    let path = request
        .path_var()
        .unwrap_or_else(|| OsString::from(default_path));
    let dirs = search_dirs(&path);

    which(executable.as_os_str(), &dirs).ok_or_else(|| {
        ProcessError::ExecutableNotFound(format!(
            "{} (searched {})",
            executable.display(),
            path.to_string_lossy()
        ))
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use procsup_core::BackendCapabilities;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    fn subdir(root: &TempDir, name: &str) -> PathBuf {
        let dir = root.path().join(name);
        fs::create_dir(&dir).unwrap();
        dir
    }

    #[test]
    fn skips_non_executable_matches_in_search_order() {
        let root = TempDir::new().unwrap();
        let foobar = subdir(&root, "foobar");
        let foobaz = subdir(&root, "foobaz");
        let bazfoo = subdir(&root, "bazfoo");
        let bazbar = subdir(&root, "bazbar");

        touch(&foobar, "executable", 0o000);
        let first = touch(&foobaz, "executable", 0o700);
        let second = touch(&bazfoo, "executable", 0o700);
        let third = touch(&bazfoo, "executable.bin", 0o700);
        touch(&bazbar, "executable", 0o000);

        let dirs = vec![foobar, foobaz, bazfoo, bazbar];
        let extensions = parse_extensions(OsStr::new(".bin;;"));
        let found =
            which_all_with(OsStr::new("executable"), &dirs, &extensions, is_executable);

        assert_eq!(found, vec![first, second, third]);
    }

    #[test]
    fn which_returns_first_match() {
        let root = TempDir::new().unwrap();
        let a = subdir(&root, "a");
        let b = subdir(&root, "b");
        touch(&a, "tool", 0o644);
        let wanted = touch(&b, "tool", 0o755);

        assert_eq!(which(OsStr::new("tool"), &[a, b]), Some(wanted));
    }

    #[test]
    fn owner_execute_bit_alone_qualifies() {
        let root = TempDir::new().unwrap();
        let a = subdir(&root, "a");
        let tool = touch(&a, "tool", 0o100);

        assert!(is_executable(&tool));
        assert_eq!(which(OsStr::new("tool"), &[a]), Some(tool));
    }

    #[test]
    fn directories_are_not_executables() {
        let root = TempDir::new().unwrap();
        let a = subdir(&root, "a");
        fs::create_dir(a.join("tool")).unwrap();

        assert_eq!(which(OsStr::new("tool"), &[a]), None);
    }

    #[test]
    fn extension_probing_stays_directory_major() {
        let root = TempDir::new().unwrap();
        let a = subdir(&root, "a");
        let b = subdir(&root, "b");
        let in_a = touch(&a, "tool.exe", 0o644);
        let in_b = touch(&b, "tool", 0o644);

        let extensions = parse_extensions(OsStr::new(".EXE;.exe"));
        let found = which_all_with(OsStr::new("tool"), &[a, b], &extensions, |p| p.is_file());
        assert_eq!(found, vec![in_a, in_b]);
    }

    #[test]
    fn resolves_along_request_path() {
        let root = TempDir::new().unwrap();
        let bin = subdir(&root, "bin");
        let tool = touch(&bin, "procsup-tool", 0o755);

        let request = SpawnRequest::builder("procsup-tool")
            .env("PATH", bin.as_os_str())
            .build_for(&BackendCapabilities::posix())
            .unwrap();

        assert_eq!(resolve_executable(&request, "/nonexistent").unwrap(), tool);
    }

    #[test]
    fn falls_back_to_default_path() {
        let root = TempDir::new().unwrap();
        let bin = subdir(&root, "bin");
        let tool = touch(&bin, "procsup-tool", 0o755);

        let request = SpawnRequest::builder("procsup-tool")
            .build_for(&BackendCapabilities::posix())
            .unwrap();
        let default_path = bin.to_string_lossy().into_owned();

        assert_eq!(resolve_executable(&request, &default_path).unwrap(), tool);
    }

    #[test]
    fn names_with_separator_are_verbatim() {
        let request = SpawnRequest::builder("./does/not/exist")
            .build_for(&BackendCapabilities::posix())
            .unwrap();
        assert_eq!(
            resolve_executable(&request, "/bin").unwrap(),
            PathBuf::from("./does/not/exist")
        );
    }

    #[test]
    fn missing_executable_is_reported() {
        let request = SpawnRequest::builder("definitely_missing_cmd")
            .env("PATH", "/nonexistent")
            .build_for(&BackendCapabilities::posix())
            .unwrap();
        let err = resolve_executable(&request, "/bin").unwrap_err();
        assert!(matches!(err, ProcessError::ExecutableNotFound(_)));
    }

    #[test]
    fn empty_path_entry_is_current_dir() {
        let dirs = search_dirs(OsStr::new("/bin::/usr/bin"));
        assert_eq!(dirs[1], PathBuf::from("."));
    }
}
