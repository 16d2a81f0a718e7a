// Copyright 2024-2026 the Bungae authors. MIT license.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::Deserialize;

use crate::config::Platform;
use crate::config::ResolverConfig;
use crate::errors::ResolutionError;
use crate::fs_util::normalize_path;

/// The `package.json` fields the resolver honours, in priority order:
/// `react-native` wins over `main`.
#[derive(Debug, Default, Deserialize)]
struct PackageJson {
  main: Option<String>,
  #[serde(rename = "react-native")]
  react_native: Option<String>,
}

/// Maps import specifiers to absolute file paths. Pure function of the
/// filesystem plus an internal realpath cache; resolvers never mutate
/// build state.
pub struct Resolver {
  root: PathBuf,
  platform: Platform,
  config: ResolverConfig,
  realpath_cache: Mutex<HashMap<PathBuf, PathBuf>>,
}

impl Resolver {
  pub fn new(root: PathBuf, platform: Platform, config: ResolverConfig) -> Self {
    Self {
      root,
      platform,
      config,
      realpath_cache: Mutex::new(HashMap::new()),
    }
  }

  pub fn platform(&self) -> Platform {
    self.platform
  }

  /// Resolves `specifier` as written in a module inside `referrer_dir`.
  pub fn resolve(
    &self,
    specifier: &str,
    referrer_dir: &Path,
  ) -> Result<PathBuf, ResolutionError> {
    let mut attempts = Vec::new();

    let found = if specifier.starts_with("./")
      || specifier.starts_with("../")
      || Path::new(specifier).is_absolute()
    {
      let base = normalize_path(referrer_dir.join(specifier));
      self.resolve_file_or_dir(&base, &mut attempts)
    } else {
      self.resolve_in_node_modules(specifier, referrer_dir, &mut attempts)
    };

    match found {
      Some(path) => Ok(self.realpath(&path)),
      None => Err(ResolutionError {
        specifier: specifier.to_string(),
        referrer: referrer_dir.to_path_buf(),
        attempts,
      }),
    }
  }

  fn resolve_file_or_dir(
    &self,
    base: &Path,
    attempts: &mut Vec<PathBuf>,
  ) -> Option<PathBuf> {
    if let Some(file) = self.resolve_file(base, attempts) {
      return Some(file);
    }
    if base.is_dir() {
      return self.resolve_dir(base, attempts);
    }
    None
  }

  /// Tries `base` as a file: as written, then with platform suffix
  /// candidates for every configured extension.
  fn resolve_file(
    &self,
    base: &Path,
    attempts: &mut Vec<PathBuf>,
  ) -> Option<PathBuf> {
    if base.is_file() {
      return Some(base.to_path_buf());
    }
    attempts.push(base.to_path_buf());

    let base_str = base.to_string_lossy();
    let exts = self
      .config
      .source_exts
      .iter()
      .chain(self.config.asset_exts.iter());
    for ext in exts {
      let mut candidates = vec![format!(
        "{}.{}.{}",
        base_str,
        self.platform.as_str(),
        ext
      )];
      if self.config.prefer_native_platform
        && self.platform != Platform::Native
      {
        candidates.push(format!("{}.native.{}", base_str, ext));
      }
      candidates.push(format!("{}.{}", base_str, ext));

      for candidate in candidates {
        let candidate = PathBuf::from(candidate);
        if candidate.is_file() {
          return Some(candidate);
        }
        attempts.push(candidate);
      }
    }
    None
  }

  /// Tries `dir` as a package directory: `package.json` redirects first,
  /// then `index` with platform suffixes.
  fn resolve_dir(
    &self,
    dir: &Path,
    attempts: &mut Vec<PathBuf>,
  ) -> Option<PathBuf> {
    let manifest_path = dir.join("package.json");
    if manifest_path.is_file() {
      if let Some(manifest) = read_package_json(&manifest_path) {
        let redirect = manifest.react_native.or(manifest.main);
        if let Some(redirect) = redirect {
          let target = normalize_path(dir.join(redirect));
          if let Some(found) = self.resolve_file(&target, attempts) {
            return Some(found);
          }
          if target.is_dir() {
            if let Some(found) = self.resolve_index(&target, attempts) {
              return Some(found);
            }
          }
        }
      }
    }
    self.resolve_index(dir, attempts)
  }

  fn resolve_index(
    &self,
    dir: &Path,
    attempts: &mut Vec<PathBuf>,
  ) -> Option<PathBuf> {
    self.resolve_file(&dir.join("index"), attempts)
  }

  fn resolve_in_node_modules(
    &self,
    specifier: &str,
    referrer_dir: &Path,
    attempts: &mut Vec<PathBuf>,
  ) -> Option<PathBuf> {
    let (package_name, subpath) = split_package_specifier(specifier);

    let mut search_dirs: Vec<PathBuf> = Vec::new();
    let mut current = Some(referrer_dir);
    while let Some(dir) = current {
      search_dirs.push(dir.join("node_modules"));
      if dir == self.root {
        break;
      }
      current = dir.parent();
    }
    search_dirs.extend(self.config.node_modules_paths.iter().cloned());

    for node_modules in &search_dirs {
      for package_dir in
        package_dir_candidates(node_modules, &package_name)
      {
        let base = if subpath.is_empty() {
          package_dir.clone()
        } else {
          normalize_path(package_dir.join(&subpath))
        };
        if let Some(found) = self.resolve_file_or_dir(&base, attempts) {
          return Some(found);
        }
      }
    }
    None
  }

  /// Symlinks are resolved once per distinct path; the result is cached
  /// for the resolver's lifetime.
  fn realpath(&self, path: &Path) -> PathBuf {
    let mut cache = self.realpath_cache.lock();
    if let Some(real) = cache.get(path) {
      return real.clone();
    }
    let real = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    cache.insert(path.to_path_buf(), real.clone());
    real
  }
}

fn read_package_json(path: &Path) -> Option<PackageJson> {
  let text = fs::read_to_string(path).ok()?;
  serde_json::from_str(&text).ok()
}

/// Splits `@scope/pkg/sub/path` into (`@scope/pkg`, `sub/path`).
fn split_package_specifier(specifier: &str) -> (String, String) {
  let mut segments = specifier.splitn(3, '/');
  match segments.next() {
    Some(scope) if scope.starts_with('@') => {
      let name = segments.next().unwrap_or("");
      let rest = segments.next().unwrap_or("");
      (format!("{}/{}", scope, name), rest.to_string())
    }
    Some(name) => {
      let rest = specifier[name.len()..].trim_start_matches('/');
      (name.to_string(), rest.to_string())
    }
    None => (String::new(), String::new()),
  }
}

/// Directories a package may live in under one `node_modules`: the hoisted
/// layout, pnpm's `.pnpm/<pkg>@<ver>/node_modules/<pkg>` store and Bun's
/// `.bun/<pkg>@<ver>+<hash>/node_modules/<pkg>` store. Scoped names are
/// encoded with `/` replaced by `+` inside the store directory names.
pub(crate) fn package_dir_candidates(
  node_modules: &Path,
  package_name: &str,
) -> Vec<PathBuf> {
  let mut candidates = vec![node_modules.join(package_name)];
  let encoded = package_name.replace('/', "+");
  for store in [".pnpm", ".bun"] {
    let store_dir = node_modules.join(store);
    if let Some(versioned) = latest_store_entry(&store_dir, &encoded) {
      candidates.push(versioned.join("node_modules").join(package_name));
    }
  }
  candidates
}

/// Picks the lexicographically greatest `<encoded>@<...>` entry so repeated
/// resolutions are deterministic when several versions are installed.
fn latest_store_entry(store_dir: &Path, encoded: &str) -> Option<PathBuf> {
  let prefix = format!("{}@", encoded);
  let mut matches: Vec<PathBuf> = fs::read_dir(store_dir)
    .ok()?
    .filter_map(|entry| entry.ok())
    .filter(|entry| {
      entry.file_name().to_string_lossy().starts_with(&prefix)
    })
    .map(|entry| entry.path())
    .collect();
  matches.sort();
  matches.pop()
}
