// Copyright 2024-2026 the Bungae authors. MIT license.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::checksum;
use crate::errors::AnyError;
use crate::errors::ConfigError;

pub const CONFIG_FILE_NAME: &str = "bungae.config.json";

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
  #[default]
  Ios,
  Android,
  Web,
  Native,
}

impl Platform {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Ios => "ios",
      Self::Android => "android",
      Self::Web => "web",
      Self::Native => "native",
    }
  }
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Platform {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "ios" => Ok(Self::Ios),
      "android" => Ok(Self::Android),
      "web" => Ok(Self::Web),
      "native" => Ok(Self::Native),
      _ => Err(ConfigError(format!("unknown platform \"{}\"", s))),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ResolverConfig {
  pub source_exts: Vec<String>,
  pub asset_exts: Vec<String>,
  pub platforms: Vec<String>,
  pub node_modules_paths: Vec<PathBuf>,
  pub prefer_native_platform: bool,
}

impl Default for ResolverConfig {
  fn default() -> Self {
    Self {
      source_exts: vec![
        "js".to_string(),
        "jsx".to_string(),
        "ts".to_string(),
        "tsx".to_string(),
        "cjs".to_string(),
        "mjs".to_string(),
        "json".to_string(),
      ],
      asset_exts: vec![
        "png".to_string(),
        "jpg".to_string(),
        "jpeg".to_string(),
        "gif".to_string(),
        "webp".to_string(),
        "svg".to_string(),
        "bmp".to_string(),
        "ttf".to_string(),
        "otf".to_string(),
        "mp3".to_string(),
        "mp4".to_string(),
        "wav".to_string(),
      ],
      platforms: vec![
        "ios".to_string(),
        "android".to_string(),
        "native".to_string(),
        "web".to_string(),
      ],
      node_modules_paths: Vec::new(),
      prefer_native_platform: true,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct TransformerConfig {
  /// Module the automatic JSX runtime imports `jsx`/`jsxs`/`Fragment` from.
  pub jsx_import_source: String,
  /// Whether files carrying a `@flow` pragma go through type stripping.
  pub flow: bool,
}

impl Default for TransformerConfig {
  fn default() -> Self {
    Self {
      jsx_import_source: "react".to_string(),
      flow: true,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct SerializerConfig {
  /// Extra script modules prepended to the bundle, each wrapped in an IIFE.
  pub polyfills: Vec<PathBuf>,
  /// Replaces the generated variable prelude with the contents of this
  /// file when set.
  pub prelude: Option<PathBuf>,
  /// Output flavor; only the plain `bundle` layout is produced.
  pub bundle_type: String,
  /// Modules `__r()`-initialized before the entry, by project-relative or
  /// absolute path.
  pub run_before_main_module: Vec<String>,
  /// Additional `var NAME=...;` definitions for the bundle prelude.
  pub extra_vars: BTreeMap<String, Value>,
  pub inline_source_map: bool,
  pub global_prefix: String,
  pub require_cycle_ignore_patterns: Vec<String>,
}

impl Default for SerializerConfig {
  fn default() -> Self {
    Self {
      polyfills: Vec::new(),
      prelude: None,
      bundle_type: "bundle".to_string(),
      run_before_main_module: Vec::new(),
      extra_vars: BTreeMap::new(),
      inline_source_map: false,
      global_prefix: String::new(),
      require_cycle_ignore_patterns: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ServerConfig {
  pub port: u16,
  pub use_global_hotkey: bool,
  pub forward_client_logs: bool,
  pub verify_connections: bool,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      port: 8081,
      use_global_hotkey: true,
      forward_client_logs: true,
      verify_connections: false,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct CacheConfig {
  pub enabled: bool,
  /// Cache directory; defaults to `<root>/.bungae/cache`.
  pub dir: Option<PathBuf>,
  pub max_age_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      dir: None,
      max_age_secs: 7 * 24 * 60 * 60,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct BungaeConfig {
  /// Entry specifier, resolved relative to `root`.
  pub entry: String,
  pub platform: Platform,
  pub dev: bool,
  pub minify: bool,
  /// External minifier binary invoked when `minify` is set.
  pub minifier: String,
  pub root: PathBuf,
  pub resolver: ResolverConfig,
  pub transformer: TransformerConfig,
  pub serializer: SerializerConfig,
  pub server: ServerConfig,
  pub cache: CacheConfig,
}

impl Default for BungaeConfig {
  fn default() -> Self {
    Self {
      entry: "index.js".to_string(),
      platform: Platform::default(),
      dev: true,
      minify: false,
      minifier: "terser".to_string(),
      root: PathBuf::from("."),
      resolver: ResolverConfig::default(),
      transformer: TransformerConfig::default(),
      serializer: SerializerConfig::default(),
      server: ServerConfig::default(),
      cache: CacheConfig::default(),
    }
  }
}

impl BungaeConfig {
  pub fn cache_dir(&self) -> PathBuf {
    match &self.cache.dir {
      Some(dir) => dir.clone(),
      None => self.root.join(".bungae").join("cache"),
    }
  }

  /// Fingerprint of every option that affects transform output. Part of the
  /// persistent cache key.
  pub fn fingerprint(&self) -> String {
    let relevant = serde_json::json!({
      "platform": self.platform,
      "dev": self.dev,
      "minify": self.minify,
      "transformer": self.transformer,
      "extraVars": self.serializer.extra_vars,
      "globalPrefix": self.serializer.global_prefix,
    });
    checksum::gen(&[relevant.to_string()])
  }
}

/// Deep merge of a user value over a base value: objects merge key-wise,
/// user arrays and scalars replace.
pub fn merge_json(base: &mut Value, user: Value) {
  match (base, user) {
    (Value::Object(base_map), Value::Object(user_map)) => {
      for (key, user_value) in user_map {
        match base_map.get_mut(&key) {
          Some(base_value) => merge_json(base_value, user_value),
          None => {
            base_map.insert(key, user_value);
          }
        }
      }
    }
    (base, user) => *base = user,
  }
}

/// Loads the config for a project: defaults, merged with the discovered or
/// explicitly named config file. The `root` field is forced to the project
/// root resolved by the caller.
pub fn load_config(
  root: &Path,
  maybe_config_path: Option<&Path>,
) -> Result<BungaeConfig, AnyError> {
  let config_path = match maybe_config_path {
    Some(path) => Some(path.to_path_buf()),
    None => discover_config(root),
  };

  let mut merged = serde_json::to_value(BungaeConfig::default())?;
  if let Some(path) = config_path {
    let text = std::fs::read_to_string(&path).map_err(|err| {
      ConfigError(format!("failed to read {}: {}", path.display(), err))
    })?;
    let user: Value = serde_json::from_str(&text).map_err(|err| {
      ConfigError(format!("failed to parse {}: {}", path.display(), err))
    })?;
    if !user.is_object() {
      return Err(
        ConfigError(format!("{}: expected an object", path.display())).into(),
      );
    }
    merge_json(&mut merged, user);
  }

  let mut config: BungaeConfig = serde_json::from_value(merged)
    .map_err(|err| ConfigError(err.to_string()))?;
  config.root = root.to_path_buf();
  Ok(config)
}

/// Walks upward from the project root and returns the first
/// `bungae.config.json` found.
fn discover_config(root: &Path) -> Option<PathBuf> {
  for dir in root.ancestors() {
    let candidate = dir.join(CONFIG_FILE_NAME);
    if candidate.is_file() {
      return Some(candidate);
    }
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use tempfile::TempDir;

  #[test]
  fn test_defaults() {
    let config = BungaeConfig::default();
    assert_eq!(config.entry, "index.js");
    assert_eq!(config.platform, Platform::Ios);
    assert!(config.dev);
    assert!(!config.minify);
    assert_eq!(config.server.port, 8081);
    assert!(config.resolver.prefer_native_platform);
    assert!(config.resolver.source_exts.contains(&"tsx".to_string()));
  }

  #[test]
  fn test_merge_user_scalars_override() {
    let mut base = serde_json::to_value(BungaeConfig::default()).unwrap();
    merge_json(
      &mut base,
      serde_json::json!({ "dev": false, "server": { "port": 9000 } }),
    );
    let config: BungaeConfig = serde_json::from_value(base).unwrap();
    assert!(!config.dev);
    assert_eq!(config.server.port, 9000);
    // Untouched nested values keep their defaults.
    assert!(config.server.use_global_hotkey);
  }

  #[test]
  fn test_merge_user_arrays_replace() {
    let mut base = serde_json::to_value(BungaeConfig::default()).unwrap();
    merge_json(
      &mut base,
      serde_json::json!({ "resolver": { "sourceExts": ["ts"] } }),
    );
    let config: BungaeConfig = serde_json::from_value(base).unwrap();
    assert_eq!(config.resolver.source_exts, vec!["ts".to_string()]);
  }

  #[test]
  fn test_unknown_option_is_a_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join(CONFIG_FILE_NAME);
    std::fs::write(&path, r#"{ "does_not_exist": 1 }"#).unwrap();
    let err = load_config(temp_dir.path(), Some(&path)).unwrap_err();
    assert!(err.downcast_ref::<ConfigError>().is_some());
  }

  #[test]
  fn test_discovery() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(
      temp_dir.path().join(CONFIG_FILE_NAME),
      r#"{ "platform": "android" }"#,
    )
    .unwrap();
    let config = load_config(temp_dir.path(), None).unwrap();
    assert_eq!(config.platform, Platform::Android);
    assert_eq!(config.root, temp_dir.path());
  }

  #[test]
  fn test_discovery_climbs_to_ancestors() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(
      temp_dir.path().join(CONFIG_FILE_NAME),
      r#"{ "platform": "web" }"#,
    )
    .unwrap();
    let nested = temp_dir.path().join("packages").join("app");
    std::fs::create_dir_all(&nested).unwrap();
    let config = load_config(&nested, None).unwrap();
    assert_eq!(config.platform, Platform::Web);
    // The project root stays the directory the build was asked for.
    assert_eq!(config.root, nested);
  }

  #[test]
  fn test_fingerprint_tracks_relevant_options() {
    let config = BungaeConfig::default();
    let mut other = config.clone();
    other.dev = false;
    assert_ne!(config.fingerprint(), other.fingerprint());
    let mut same = config.clone();
    same.server.port = 9999;
    assert_eq!(config.fingerprint(), same.fingerprint());
  }
}
