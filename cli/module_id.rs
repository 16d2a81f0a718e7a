// Copyright 2024-2026 the Bungae authors. MIT license.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;

use indexmap::IndexMap;

/// Handle for a module in the emitted bundle. Production builds use the
/// numeric ids handed out by [`ModuleIdFactory`]; serializer options may
/// substitute string ids (Metro's `createModuleId` seam).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModuleId {
  Number(u64),
  Name(String),
}

impl ModuleId {
  /// JSON form, exactly as it appears inside a `__d(...)` call.
  pub fn to_json(&self) -> String {
    match self {
      Self::Number(n) => n.to_string(),
      Self::Name(name) => {
        serde_json::Value::String(name.clone()).to_string()
      }
    }
  }
}

impl fmt::Display for ModuleId {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str(&self.to_json())
  }
}

/// Maps absolute paths to module ids for the emitted bundle.
pub trait ModuleIdProvider {
  fn id(&mut self, path: &Path) -> ModuleId;
}

/// Stable, monotonic path -> id assignment. Ids are handed out in the order
/// paths are first seen and never change or get recycled afterwards; the
/// factory lives on the build state so ids survive incremental rebuilds.
#[derive(Debug, Clone, Default)]
pub struct ModuleIdFactory {
  ids: IndexMap<PathBuf, u64>,
  next_id: u64,
}

impl ModuleIdFactory {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn assign(&mut self, path: &Path) -> u64 {
    if let Some(id) = self.ids.get(path) {
      return *id;
    }
    let id = self.next_id;
    self.next_id += 1;
    self.ids.insert(path.to_path_buf(), id);
    id
  }

  pub fn get(&self, path: &Path) -> Option<u64> {
    self.ids.get(path).copied()
  }

  pub fn path_for(&self, id: u64) -> Option<&Path> {
    self
      .ids
      .iter()
      .find(|(_, v)| **v == id)
      .map(|(k, _)| k.as_path())
  }

  pub fn len(&self) -> usize {
    self.ids.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ids.is_empty()
  }

  pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
    self.ids.keys()
  }
}

impl ModuleIdProvider for ModuleIdFactory {
  fn id(&mut self, path: &Path) -> ModuleId {
    ModuleId::Number(self.assign(path))
  }
}
