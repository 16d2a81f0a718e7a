// Copyright 2024-2026 the Bungae authors. MIT license.

use std::path::Path;

use serde_json::json;
use serde_json::Value;

use crate::fs_util;
use crate::graph::Module;
use crate::incremental::BuildState;
use crate::incremental::Delta;
use crate::module_id::ModuleId;
use crate::serializer;

pub fn update_start_message(is_initial_update: bool) -> Value {
  json!({
    "type": "update-start",
    "body": { "isInitialUpdate": is_initial_update },
  })
}

pub fn update_done_message() -> Value {
  json!({ "type": "update-done" })
}

pub fn error_message(kind: &str, message: &str, stack: Option<&str>) -> Value {
  let mut body = json!({ "type": kind, "message": message });
  if let Some(stack) = stack {
    body["stack"] = json!(stack);
  }
  json!({ "type": "error", "body": body })
}

pub fn bundle_registered_message() -> Value {
  json!({ "type": "bundle-registered" })
}

/// The `update` frame of Metro's HMR protocol: per-module `__d(...)`
/// strings for added and modified modules, numeric ids for deleted ones.
/// Deleted ids resolve through the old state; everything else through the
/// new one.
pub fn update_message(
  delta: &Delta,
  old_state: &BuildState,
  new_state: &BuildState,
  project_root: &Path,
  is_initial_update: bool,
) -> Value {
  let added: Vec<Value> = delta
    .added
    .values()
    .filter_map(|module| hmr_module(new_state, module, project_root))
    .collect();
  let modified: Vec<Value> = delta
    .modified
    .values()
    .filter_map(|module| hmr_module(new_state, module, project_root))
    .collect();
  let deleted: Vec<Value> = delta
    .deleted
    .iter()
    .filter_map(|path| old_state.path_to_id(path))
    .map(Value::from)
    .collect();

  json!({
    "type": "update",
    "body": {
      "revisionId": new_state.revision_id,
      "isInitialUpdate": is_initial_update,
      "added": added,
      "modified": modified,
      "deleted": deleted,
    }
  })
}

/// One `added`/`modified` entry. The module's `__d(...)` string receives a
/// trailing parameter object mapping inverse-dependency paths to their
/// ids, spliced in through the same final-paren mechanism the serializer
/// uses.
fn hmr_module(
  state: &BuildState,
  module: &Module,
  project_root: &Path,
) -> Option<Value> {
  let id = state.path_to_id(&module.path)?;
  let dep_ids: Vec<ModuleId> = module
    .resolved_dependencies
    .iter()
    .filter_map(|dep| state.path_to_id(dep))
    .map(ModuleId::Number)
    .collect();
  let source_url = fs_util::relative_path(project_root, &module.path);

  let wrapped = serializer::wrap_module(
    &module.transformed_code,
    &ModuleId::Number(id),
    &dep_ids,
    Some(&source_url),
  );
  let mut inverse = serde_json::Map::new();
  for parent in &module.inverse_dependencies {
    if let Some(parent_id) = state.path_to_id(parent) {
      inverse.insert(
        fs_util::relative_path(project_root, parent),
        Value::from(parent_id),
      );
    }
  }
  let wrapped = serializer::add_params_to_define_call(
    &wrapped,
    &Value::Object(inverse).to_string(),
  );

  Some(json!({
    "module": [id, wrapped],
    "sourceURL": source_url,
    "sourceMappingURL": format!("{}.map", source_url),
  }))
}
