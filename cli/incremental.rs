// Copyright 2024-2026 the Bungae authors. MIT license.

use std::collections::BTreeSet;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use anyhow::anyhow;
use indexmap::IndexMap;

use crate::errors::AnyError;
use crate::fs_util;
use crate::graph;
use crate::graph::Graph;
use crate::graph::GraphBuilder;
use crate::graph::Module;
use crate::module_id::ModuleIdFactory;

static REVISION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque token identifying a graph state; fresh on every successful full
/// or incremental build.
pub fn next_revision_id() -> String {
  let count = REVISION_COUNTER.fetch_add(1, Ordering::SeqCst);
  format!("{}-{:08x}", count, fastrand::u32(..))
}

/// Everything the dev server retains between rebuilds of one platform.
/// The id factory lives here so ids stay stable across rebuilds (and
/// across cache invalidation) for the lifetime of the server.
#[derive(Debug, Clone)]
pub struct BuildState {
  pub graph: Graph,
  pub id_factory: ModuleIdFactory,
  pub revision_id: String,
}

impl BuildState {
  pub fn new(graph: Graph, mut id_factory: ModuleIdFactory) -> Self {
    graph::assign_ids(&graph, &mut id_factory);
    Self {
      graph,
      id_factory,
      revision_id: next_revision_id(),
    }
  }

  pub fn path_to_id(&self, path: &Path) -> Option<u64> {
    self.id_factory.get(path)
  }

  pub fn id_to_path(&self, id: u64) -> Option<&Path> {
    self.id_factory.path_for(id)
  }
}

/// The result of an incremental rebuild: three disjoint sets.
#[derive(Debug, Clone, Default)]
pub struct Delta {
  pub added: IndexMap<PathBuf, Module>,
  pub modified: IndexMap<PathBuf, Module>,
  pub deleted: BTreeSet<PathBuf>,
}

impl Delta {
  pub fn is_empty(&self) -> bool {
    self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
  }
}

pub struct IncrementalBuild {
  pub delta: Delta,
  pub state: BuildState,
}

/// Applies a batch of changed paths to a retained build state, producing a
/// delta and the next state. The old state is never mutated, so a failure
/// here leaves the previous bundle fully usable.
pub async fn incremental_build(
  changed_paths: &[PathBuf],
  old_state: &BuildState,
  builder: &GraphBuilder,
) -> Result<IncrementalBuild, AnyError> {
  let mut graph = old_state.graph.clone();
  let mut delta = Delta::default();

  // Watcher events for files outside the graph are irrelevant; ignore
  // them instead of transforming unreachable files.
  let mut to_retransform: VecDeque<PathBuf> = VecDeque::new();
  let mut to_delete: Vec<PathBuf> = Vec::new();
  for changed in changed_paths {
    let path = match fs_util::canonicalize_path(changed) {
      Ok(path) => path,
      Err(_) => fs_util::normalize_path(changed),
    };
    if !graph.contains(&path) {
      continue;
    }
    if path.is_file() {
      to_retransform.push_back(path);
    } else {
      to_delete.push(path);
    }
  }

  if to_delete.iter().any(|path| path == graph.entry()) {
    return Err(anyhow!(
      "entry {} was deleted; a full rebuild is required",
      graph.entry().display()
    ));
  }

  // Re-transform changed modules, then transform any dependency they now
  // reach that is not in the graph yet.
  let mut processed: HashSet<PathBuf> = HashSet::new();
  let mut removal_candidates: VecDeque<PathBuf> = VecDeque::new();
  while let Some(path) = to_retransform.pop_front() {
    if !processed.insert(path.clone()) {
      continue;
    }
    let mut module = builder.build_module(path.clone()).await?;
    let old = graph.get(&path);
    let is_new = old.is_none();
    let old_deps: HashSet<PathBuf> = old
      .map(|m| m.resolved_dependencies.iter().cloned().collect())
      .unwrap_or_default();
    module.inverse_dependencies = old
      .map(|m| m.inverse_dependencies.clone())
      .unwrap_or_default();

    for dep in &module.resolved_dependencies {
      if !graph.contains(dep) && !processed.contains(dep) {
        to_retransform.push_back(dep.clone());
      }
    }
    for dropped in old_deps
      .iter()
      .filter(|d| !module.resolved_dependencies.contains(d))
    {
      removal_candidates.push_back(dropped.clone());
    }

    graph.insert(module.clone());
    if is_new {
      delta.added.insert(path, module);
    } else {
      delta.modified.insert(path, module);
    }
  }

  // Deleted files leave the graph unconditionally; their dependencies may
  // cascade below.
  for path in to_delete {
    if let Some(removed) = graph.remove(&path) {
      removal_candidates.extend(removed.resolved_dependencies);
      delta.deleted.insert(path);
    }
  }

  rebuild_inverse_edges(&mut graph);

  // Reference-count pruning: a former dependency with no remaining
  // importers leaves the graph, releasing its own dependencies in turn.
  while let Some(candidate) = removal_candidates.pop_front() {
    if candidate == graph.entry() || !graph.contains(&candidate) {
      continue;
    }
    let orphaned = graph
      .get(&candidate)
      .map(|m| m.inverse_dependencies.is_empty())
      .unwrap_or(false);
    if !orphaned {
      continue;
    }
    if let Some(removed) = graph.remove(&candidate) {
      for dep in &removed.resolved_dependencies {
        if let Some(target) = graph.get_mut(dep) {
          target.inverse_dependencies.remove(&candidate);
        }
        removal_candidates.push_back(dep.clone());
      }
      delta.added.shift_remove(&candidate);
      delta.modified.shift_remove(&candidate);
      delta.deleted.insert(candidate);
    }
  }

  // Delta entries carry the final edge state, not the snapshot taken
  // before pruning.
  for (path, module) in delta.added.iter_mut().chain(delta.modified.iter_mut())
  {
    if let Some(current) = graph.get(path) {
      module.inverse_dependencies = current.inverse_dependencies.clone();
    }
  }

  // Additions get ids through the retained factory; everything already
  // assigned keeps its id (ids are never recycled).
  let mut id_factory = old_state.id_factory.clone();
  graph::assign_ids(&graph, &mut id_factory);

  Ok(IncrementalBuild {
    delta,
    state: BuildState {
      graph,
      id_factory,
      revision_id: next_revision_id(),
    },
  })
}

fn rebuild_inverse_edges(graph: &mut Graph) {
  let paths: Vec<PathBuf> = graph.paths().cloned().collect();
  for path in &paths {
    if let Some(module) = graph.get_mut(path) {
      module.inverse_dependencies.clear();
    }
  }
  let edges: Vec<(PathBuf, PathBuf)> = graph
    .modules()
    .flat_map(|module| {
      module
        .resolved_dependencies
        .iter()
        .map(move |dep| (dep.clone(), module.path.clone()))
    })
    .collect();
  for (target, parent) in edges {
    if let Some(module) = graph.get_mut(&target) {
      module.inverse_dependencies.insert(parent);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::BungaeConfig;
  use crate::graph::CancelFlag;
  use std::fs;
  use std::sync::Arc;
  use tempfile::TempDir;

  fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
  }

  fn make_builder(root: &Path) -> GraphBuilder {
    let mut config = BungaeConfig::default();
    config.root = root.to_path_buf();
    config.cache.enabled = false;
    GraphBuilder::new(Arc::new(config), None)
  }

  async fn initial_state(root: &Path, entry: &str) -> (GraphBuilder, BuildState) {
    let builder = make_builder(root);
    let graph = builder
      .build(&root.join(entry), &CancelFlag::default())
      .await
      .unwrap();
    let state = BuildState::new(graph, ModuleIdFactory::new());
    (builder, state)
  }

  fn graph_path(state: &BuildState, suffix: &str) -> PathBuf {
    state
      .graph
      .paths()
      .find(|p| p.ends_with(suffix))
      .unwrap()
      .clone()
  }

  #[tokio::test]
  async fn test_modified_module() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "index.js", "const m = require('./module');\nconsole.log(m);");
    write(root, "module.js", "module.exports = 'original';");
    let (builder, state) = initial_state(root, "index.js").await;
    let module_path = graph_path(&state, "module.js");
    let old_id = state.path_to_id(&module_path).unwrap();

    write(root, "module.js", "module.exports = 'modified';");
    let result =
      incremental_build(&[module_path.clone()], &state, &builder)
        .await
        .unwrap();

    assert_eq!(result.delta.modified.len(), 1);
    assert!(result.delta.modified.contains_key(&module_path));
    assert!(result.delta.added.is_empty());
    assert!(result.delta.deleted.is_empty());
    assert_eq!(result.state.path_to_id(&module_path), Some(old_id));
    assert!(result
      .state
      .graph
      .get(&module_path)
      .unwrap()
      .transformed_code
      .contains("modified"));
    assert_ne!(result.state.revision_id, state.revision_id);
  }

  #[tokio::test]
  async fn test_ids_are_retained_for_surviving_paths() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "index.js", "require('./a');\nrequire('./b');");
    write(root, "a.js", "module.exports = 1;");
    write(root, "b.js", "module.exports = 2;");
    let (builder, state) = initial_state(root, "index.js").await;

    write(root, "a.js", "module.exports = 'changed';");
    let result = incremental_build(
      &[graph_path(&state, "a.js")],
      &state,
      &builder,
    )
    .await
    .unwrap();

    // P4: ids agree on every path present in both states.
    for path in state.graph.paths() {
      if result.state.graph.contains(path) {
        assert_eq!(state.path_to_id(path), result.state.path_to_id(path));
      }
    }
  }

  #[tokio::test]
  async fn test_added_dependency() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "index.js", "module.exports = 1;");
    let (builder, state) = initial_state(root, "index.js").await;
    let entry = state.graph.entry().to_path_buf();

    write(root, "fresh.js", "module.exports = 'fresh';");
    write(root, "index.js", "const f = require('./fresh');\nmodule.exports = f;");
    let result = incremental_build(&[entry.clone()], &state, &builder)
      .await
      .unwrap();

    assert_eq!(result.delta.modified.len(), 1);
    assert_eq!(result.delta.added.len(), 1);
    let added_path = result.delta.added.keys().next().unwrap().clone();
    assert!(added_path.ends_with("fresh.js"));
    // New module got a fresh id beyond the retained ones.
    assert!(result.state.path_to_id(&added_path).unwrap() >= 1);
    // The new edge is tracked in both directions.
    let fresh = result.state.graph.get(&added_path).unwrap();
    assert!(fresh.inverse_dependencies.contains(&entry));
  }

  #[tokio::test]
  async fn test_cascading_delete() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "index.js", "require('./a');");
    write(root, "a.js", "require('./b');");
    write(root, "b.js", "module.exports = 1;");
    let (builder, state) = initial_state(root, "index.js").await;
    let entry = state.graph.entry().to_path_buf();
    let a = graph_path(&state, "a.js");
    let b = graph_path(&state, "b.js");

    write(root, "index.js", "module.exports = 1;");
    let result = incremental_build(&[entry], &state, &builder)
      .await
      .unwrap();

    assert!(result.delta.deleted.contains(&a));
    assert!(result.delta.deleted.contains(&b));
    assert_eq!(result.state.graph.len(), 1);
    // Ids for deleted paths are retained by the factory, not recycled.
    assert_eq!(result.state.path_to_id(&a), state.path_to_id(&a));
  }

  #[tokio::test]
  async fn test_shared_dependency_survives_partial_delete() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "index.js", "require('./a');\nrequire('./shared');");
    write(root, "a.js", "require('./shared');");
    write(root, "shared.js", "module.exports = 1;");
    let (builder, state) = initial_state(root, "index.js").await;
    let entry = state.graph.entry().to_path_buf();
    let shared = graph_path(&state, "shared.js");

    // Dropping `a` must not delete `shared`, which the entry still uses.
    write(root, "index.js", "require('./shared');");
    let result = incremental_build(&[entry], &state, &builder)
      .await
      .unwrap();
    assert!(result.state.graph.contains(&shared));
    assert_eq!(
      result
        .delta
        .deleted
        .iter()
        .filter(|p| p.ends_with("a.js"))
        .count(),
      1
    );
  }

  #[tokio::test]
  async fn test_deleted_file() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "index.js", "require('./a');");
    write(root, "a.js", "module.exports = 1;");
    let (builder, state) = initial_state(root, "index.js").await;
    let entry = state.graph.entry().to_path_buf();
    let a = graph_path(&state, "a.js");

    fs::remove_file(&a).unwrap();
    write(root, "index.js", "module.exports = 1;");
    let result = incremental_build(&[entry, a.clone()], &state, &builder)
      .await
      .unwrap();
    assert!(result.delta.deleted.contains(&a));
    assert!(!result.state.graph.contains(&a));
  }

  #[tokio::test]
  async fn test_empty_change_set_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "index.js", "module.exports = 1;");
    let (builder, state) = initial_state(root, "index.js").await;

    let result = incremental_build(&[], &state, &builder).await.unwrap();
    assert!(result.delta.is_empty());
    assert_eq!(result.state.graph.len(), state.graph.len());
    for path in state.graph.paths() {
      assert_eq!(state.path_to_id(path), result.state.path_to_id(path));
    }
    assert_ne!(result.state.revision_id, state.revision_id);
  }

  #[tokio::test]
  async fn test_unknown_changed_path_is_ignored() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "index.js", "module.exports = 1;");
    write(root, "unrelated.js", "module.exports = 2;");
    let (builder, state) = initial_state(root, "index.js").await;

    let result = incremental_build(
      &[root.join("unrelated.js")],
      &state,
      &builder,
    )
    .await
    .unwrap();
    assert!(result.delta.is_empty());
  }

  #[tokio::test]
  async fn test_entry_deletion_is_fatal() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "index.js", "module.exports = 1;");
    let (builder, state) = initial_state(root, "index.js").await;
    let entry = state.graph.entry().to_path_buf();

    fs::remove_file(&entry).unwrap();
    let err = incremental_build(&[entry], &state, &builder).await;
    assert!(err.is_err());
  }

  #[tokio::test]
  async fn test_transform_failure_leaves_old_state_usable() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(root, "index.js", "require('./a');");
    write(root, "a.js", "module.exports = 1;");
    let (builder, state) = initial_state(root, "index.js").await;
    let a = graph_path(&state, "a.js");

    write(root, "a.js", "const = ;");
    let err = incremental_build(&[a.clone()], &state, &builder).await;
    assert!(err.is_err());
    // The old state still holds the last good module.
    assert!(state
      .graph
      .get(&a)
      .unwrap()
      .transformed_code
      .contains("module.exports"));
  }
}
