// Copyright 2024-2026 the Bungae authors. MIT license.

use std::path::Path;

/// How a file participates in the build, determined by its extension.
/// Assets are classified separately against the configured asset
/// extensions, so they are not represented here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
  JavaScript,
  Jsx,
  TypeScript,
  Tsx,
  Json,
  Unknown,
}

impl MediaType {
  pub fn from_path(path: &Path) -> Self {
    match path.extension().and_then(|ext| ext.to_str()) {
      Some("js") | Some("cjs") | Some("mjs") => Self::JavaScript,
      Some("jsx") => Self::Jsx,
      Some("ts") | Some("cts") | Some("mts") => Self::TypeScript,
      Some("tsx") => Self::Tsx,
      Some("json") => Self::Json,
      _ => Self::Unknown,
    }
  }

  /// True for the TypeScript flavors that require type stripping.
  pub fn is_typed(&self) -> bool {
    matches!(self, Self::TypeScript | Self::Tsx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_from_path() {
    assert_eq!(
      MediaType::from_path(Path::new("/a/b.js")),
      MediaType::JavaScript
    );
    assert_eq!(MediaType::from_path(Path::new("/a/b.cjs")), MediaType::JavaScript);
    assert_eq!(MediaType::from_path(Path::new("/a/b.jsx")), MediaType::Jsx);
    assert_eq!(
      MediaType::from_path(Path::new("/a/b.ts")),
      MediaType::TypeScript
    );
    assert_eq!(MediaType::from_path(Path::new("/a/b.tsx")), MediaType::Tsx);
    assert_eq!(MediaType::from_path(Path::new("/a/b.json")), MediaType::Json);
    assert_eq!(MediaType::from_path(Path::new("/a/b.png")), MediaType::Unknown);
    assert_eq!(MediaType::from_path(Path::new("/a/b")), MediaType::Unknown);
  }

  #[test]
  fn test_is_typed() {
    assert!(MediaType::TypeScript.is_typed());
    assert!(MediaType::Tsx.is_typed());
    assert!(!MediaType::JavaScript.is_typed());
    assert!(!MediaType::Json.is_typed());
  }
}
