// Copyright 2024-2026 the Bungae authors. MIT license.

use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

/// Writes the data to a temporary sibling file and renames it into place,
/// so readers never observe a partially written file.
pub fn atomic_write_file<T: AsRef<[u8]>>(
  filename: &Path,
  data: T,
) -> io::Result<()> {
  let rand: String = (0..4).map(|_| format!("{:02x}", fastrand::u8(..))).collect();
  let extension = format!("{}.tmp", rand);
  let tmp_file = filename.with_extension(extension);
  write_file(&tmp_file, data)?;
  fs::rename(tmp_file, filename)?;
  Ok(())
}

pub fn write_file<T: AsRef<[u8]>>(filename: &Path, data: T) -> io::Result<()> {
  let mut file = OpenOptions::new()
    .write(true)
    .truncate(true)
    .create(true)
    .open(filename)?;
  file.write_all(data.as_ref())
}

/// Canonicalizes a path, resolving symlinks. Fails when the path does not
/// exist.
pub fn canonicalize_path(path: &Path) -> io::Result<PathBuf> {
  fs::canonicalize(path)
}

/// Normalizes a path without touching the filesystem: strips `.` segments
/// and folds `..` into their parents.
pub fn normalize_path<P: AsRef<Path>>(path: P) -> PathBuf {
  let mut components = path.as_ref().components().peekable();
  let mut ret =
    if let Some(c @ Component::Prefix(..)) = components.peek().cloned() {
      components.next();
      PathBuf::from(c.as_os_str())
    } else {
      PathBuf::new()
    };

  for component in components {
    match component {
      Component::Prefix(..) => unreachable!(),
      Component::RootDir => {
        ret.push(component.as_os_str());
      }
      Component::CurDir => {}
      Component::ParentDir => {
        ret.pop();
      }
      Component::Normal(c) => {
        ret.push(c);
      }
    }
  }
  ret
}

/// Path of `path` relative to `root`, with forward slashes regardless of
/// platform. Falls back to the full path when `path` is not under `root`.
pub fn relative_path(root: &Path, path: &Path) -> String {
  let rel = path.strip_prefix(root).unwrap_or(path);
  let parts: Vec<String> = rel
    .components()
    .filter_map(|c| match c {
      Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
      _ => None,
    })
    .collect();
  parts.join("/")
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn test_atomic_write_file() {
    let temp_dir = TempDir::new().unwrap();
    let file_path = temp_dir.path().join("out.json");
    atomic_write_file(&file_path, b"first").unwrap();
    assert_eq!(fs::read(&file_path).unwrap(), b"first");
    atomic_write_file(&file_path, b"second").unwrap();
    assert_eq!(fs::read(&file_path).unwrap(), b"second");
    // No temporary files are left behind.
    let leftovers: Vec<_> = fs::read_dir(temp_dir.path())
      .unwrap()
      .filter_map(|e| e.ok())
      .filter(|e| e.path() != file_path)
      .collect();
    assert!(leftovers.is_empty());
  }

  #[test]
  fn test_normalize_path() {
    assert_eq!(normalize_path("/a/b/./c"), PathBuf::from("/a/b/c"));
    assert_eq!(normalize_path("/a/b/../c"), PathBuf::from("/a/c"));
    assert_eq!(normalize_path("/a/b/c/.."), PathBuf::from("/a/b"));
    assert_eq!(normalize_path("a/../../b"), PathBuf::from("b"));
  }

  #[test]
  fn test_relative_path() {
    assert_eq!(
      relative_path(Path::new("/root"), Path::new("/root/src/app.js")),
      "src/app.js"
    );
    assert_eq!(
      relative_path(Path::new("/root"), Path::new("/elsewhere/app.js")),
      "elsewhere/app.js"
    );
  }
}
