// Copyright 2024-2026 the Bungae authors. MIT license.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use indexmap::IndexMap;

use crate::ast;
use crate::ast::TransformOptions;
use crate::ast::TransformOutput;
use crate::checksum;
use crate::config::BungaeConfig;
use crate::disk_cache::unix_now;
use crate::disk_cache::CacheEntry;
use crate::disk_cache::TransformCache;
use crate::errors::AnyError;
use crate::fs_util;
use crate::media_type::MediaType;
use crate::module_id::ModuleIdFactory;
use crate::resolver::Resolver;

/// The flavor of a module in the serialized bundle. `js/script*` modules
/// are emitted verbatim, never wrapped in `__d()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleType {
  Module,
  Script,
  ScriptVirtual,
}

impl ModuleType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Module => "js/module",
      Self::Script => "js/script",
      Self::ScriptVirtual => "js/script/virtual",
    }
  }

  pub fn is_script(&self) -> bool {
    matches!(self, Self::Script | Self::ScriptVirtual)
  }
}

/// One source file participating in the build.
#[derive(Debug, Clone)]
pub struct Module {
  pub path: PathBuf,
  pub module_type: ModuleType,
  /// Dependency strings exactly as written, in source order.
  pub original_specifiers: Vec<String>,
  /// Absolute paths aligned 1:1 with `original_specifiers`.
  pub resolved_dependencies: Vec<PathBuf>,
  pub inverse_dependencies: BTreeSet<PathBuf>,
  pub transformed_code: String,
  pub source_map: Option<String>,
  pub content_hash: String,
}

/// The closure of modules reachable from the entry.
#[derive(Debug, Clone, Default)]
pub struct Graph {
  entry: PathBuf,
  modules: IndexMap<PathBuf, Module>,
}

impl Graph {
  pub fn new(entry: PathBuf) -> Self {
    Self {
      entry,
      modules: IndexMap::new(),
    }
  }

  pub fn entry(&self) -> &Path {
    &self.entry
  }

  pub fn get(&self, path: &Path) -> Option<&Module> {
    self.modules.get(path)
  }

  pub fn get_mut(&mut self, path: &Path) -> Option<&mut Module> {
    self.modules.get_mut(path)
  }

  pub fn contains(&self, path: &Path) -> bool {
    self.modules.contains_key(path)
  }

  pub fn insert(&mut self, module: Module) {
    self.modules.insert(module.path.clone(), module);
  }

  pub fn remove(&mut self, path: &Path) -> Option<Module> {
    self.modules.shift_remove(path)
  }

  pub fn len(&self) -> usize {
    self.modules.len()
  }

  pub fn is_empty(&self) -> bool {
    self.modules.is_empty()
  }

  pub fn modules(&self) -> impl Iterator<Item = &Module> {
    self.modules.values()
  }

  pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
    self.modules.keys()
  }
}

/// Cooperative cancellation for an in-flight build. Workers check the flag
/// between files; a cancelled build leaves prior state untouched.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

struct ModuleSource {
  content_hash: String,
  code: String,
  source_map: Option<String>,
  specifiers: Vec<String>,
}

/// Builds module graphs: a single coordinator owns the module map and the
/// queue, transform work fans out to blocking worker tasks, and all
/// resolution and edge bookkeeping happens back on the coordinator.
pub struct GraphBuilder {
  config: Arc<BungaeConfig>,
  resolver: Arc<Resolver>,
  cache: Option<Arc<TransformCache>>,
  transform_options: TransformOptions,
  config_fingerprint: String,
  concurrency: usize,
}

impl GraphBuilder {
  pub fn new(
    config: Arc<BungaeConfig>,
    cache: Option<Arc<TransformCache>>,
  ) -> Self {
    let resolver = Arc::new(Resolver::new(
      config.root.clone(),
      config.platform,
      config.resolver.clone(),
    ));
    let transform_options = TransformOptions {
      platform: config.platform,
      dev: config.dev,
      jsx_import_source: config.transformer.jsx_import_source.clone(),
      source_maps: config.dev,
      flow: config.transformer.flow,
    };
    let config_fingerprint = config.fingerprint();
    let concurrency = std::thread::available_parallelism()
      .map(|n| n.get())
      .unwrap_or(4);
    Self {
      config,
      resolver,
      cache,
      transform_options,
      config_fingerprint,
      concurrency,
    }
  }

  pub fn resolver(&self) -> &Resolver {
    &self.resolver
  }

  /// Builds the full graph for `entry`. Any resolution or transform error
  /// aborts the build; no partial graph is returned.
  pub async fn build(
    &self,
    entry: &Path,
    cancel: &CancelFlag,
  ) -> Result<Graph, AnyError> {
    let entry = fs_util::canonicalize_path(entry)
      .with_context(|| format!("entry not found: {}", entry.display()))?;
    let mut graph = Graph::new(entry.clone());
    let mut inverse: HashMap<PathBuf, BTreeSet<PathBuf>> = HashMap::new();
    let mut pending: VecDeque<PathBuf> = VecDeque::new();
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut in_flight = FuturesUnordered::new();

    pending.push_back(entry.clone());
    seen.insert(entry);

    loop {
      while in_flight.len() < self.concurrency {
        match pending.pop_front() {
          Some(path) => in_flight.push(self.spawn_transform(path, cancel)),
          None => break,
        }
      }
      let Some(joined) = in_flight.next().await else {
        break;
      };
      if cancel.is_cancelled() {
        return Err(anyhow!("build cancelled"));
      }
      let (path, result) = joined?;
      let source = result?;

      let referrer_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));
      let mut resolved = Vec::with_capacity(source.specifiers.len());
      for specifier in &source.specifiers {
        let target = self.resolver.resolve(specifier, &referrer_dir)?;
        if seen.insert(target.clone()) {
          pending.push_back(target.clone());
        }
        inverse.entry(target.clone()).or_default().insert(path.clone());
        resolved.push(target);
      }

      graph.insert(Module {
        path,
        module_type: ModuleType::Module,
        original_specifiers: source.specifiers,
        resolved_dependencies: resolved,
        inverse_dependencies: BTreeSet::new(),
        transformed_code: source.code,
        source_map: source.source_map,
        content_hash: source.content_hash,
      });
    }

    for (path, parents) in inverse {
      if let Some(module) = graph.get_mut(&path) {
        module.inverse_dependencies.extend(parents);
      }
    }
    Ok(graph)
  }

  /// Transforms and resolves a single module; used by incremental builds.
  /// The returned module carries no inverse edges.
  pub async fn build_module(&self, path: PathBuf) -> Result<Module, AnyError> {
    let cancel = CancelFlag::default();
    let (path, result) = self.spawn_transform(path, &cancel).await?;
    let source = result?;
    let referrer_dir = path
      .parent()
      .map(Path::to_path_buf)
      .unwrap_or_else(|| PathBuf::from("/"));
    let mut resolved = Vec::with_capacity(source.specifiers.len());
    for specifier in &source.specifiers {
      resolved.push(self.resolver.resolve(specifier, &referrer_dir)?);
    }
    Ok(Module {
      path,
      module_type: ModuleType::Module,
      original_specifiers: source.specifiers,
      resolved_dependencies: resolved,
      inverse_dependencies: BTreeSet::new(),
      transformed_code: source.code,
      source_map: source.source_map,
      content_hash: source.content_hash,
    })
  }

  fn spawn_transform(
    &self,
    path: PathBuf,
    cancel: &CancelFlag,
  ) -> tokio::task::JoinHandle<(PathBuf, Result<ModuleSource, AnyError>)> {
    let config = self.config.clone();
    let cache = self.cache.clone();
    let options = self.transform_options.clone();
    let fingerprint = self.config_fingerprint.clone();
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || {
      if cancel.is_cancelled() {
        return (path, Err(anyhow!("build cancelled")));
      }
      let result = load_and_transform(
        &config,
        cache.as_deref(),
        &options,
        &fingerprint,
        &path,
      );
      (path, result)
    })
  }
}

fn load_and_transform(
  config: &BungaeConfig,
  cache: Option<&TransformCache>,
  options: &TransformOptions,
  fingerprint: &str,
  path: &Path,
) -> Result<ModuleSource, AnyError> {
  let bytes = fs::read(path)
    .with_context(|| format!("failed to read {}", path.display()))?;
  let content_hash = checksum::gen(&[&bytes]);

  if let Some(cache) = cache {
    if let Some(entry) = cache.get(&content_hash, fingerprint) {
      return Ok(ModuleSource {
        content_hash,
        code: entry.code,
        source_map: entry.source_map,
        specifiers: entry.dependencies,
      });
    }
  }

  let output = if is_asset(config, path) {
    asset_module(config, path)
  } else {
    let source = String::from_utf8(bytes)
      .with_context(|| format!("{} is not utf-8", path.display()))?;
    match MediaType::from_path(path) {
      MediaType::Json => TransformOutput {
        code: format!("module.exports = {};", source.trim()),
        source_map: None,
        specifiers: Vec::new(),
      },
      media_type => ast::transform(path, &source, media_type, options)?,
    }
  };

  if let Some(cache) = cache {
    let entry = CacheEntry {
      code: output.code.clone(),
      source_map: output.source_map.clone(),
      dependencies: output.specifiers.clone(),
      content_hash: content_hash.clone(),
      created_at: unix_now(),
    };
    if let Err(err) = cache.set(&content_hash, fingerprint, &entry) {
      log::warn!("failed to write cache entry for {}: {}", path.display(), err);
    }
  }

  Ok(ModuleSource {
    content_hash,
    code: output.code,
    source_map: output.source_map,
    specifiers: output.specifiers,
  })
}

fn is_asset(config: &BungaeConfig, path: &Path) -> bool {
  match path.extension().and_then(|e| e.to_str()) {
    Some(ext) => config
      .resolver
      .asset_exts
      .iter()
      .any(|asset_ext| asset_ext == ext),
    None => false,
  }
}

/// Assets become tiny registration modules pointing the client at the dev
/// server's `/assets/` route.
fn asset_module(config: &BungaeConfig, path: &Path) -> TransformOutput {
  let rel_dir = path
    .parent()
    .map(|dir| fs_util::relative_path(&config.root, dir))
    .unwrap_or_default();
  let http_location = if rel_dir.is_empty() {
    "/assets".to_string()
  } else {
    format!("/assets/{}", rel_dir)
  };
  let name = path
    .file_stem()
    .map(|s| s.to_string_lossy().into_owned())
    .unwrap_or_default();
  let asset_type = path
    .extension()
    .map(|s| s.to_string_lossy().into_owned())
    .unwrap_or_default();
  let descriptor = serde_json::json!({
    "__packager_asset": true,
    "httpServerLocation": http_location,
    "name": name,
    "type": asset_type,
  });
  TransformOutput {
    code: format!("module.exports = {};", descriptor),
    source_map: None,
    specifiers: Vec::new(),
  }
}

/// Assigns ids for every module in the graph in a deterministic final
/// pass: breadth-first from the entry, dependencies in source order. This
/// makes numbering independent of worker completion order.
pub fn assign_ids(graph: &Graph, factory: &mut ModuleIdFactory) {
  let mut queue = VecDeque::new();
  let mut seen = HashSet::new();
  queue.push_back(graph.entry().to_path_buf());
  seen.insert(graph.entry().to_path_buf());

  while let Some(path) = queue.pop_front() {
    factory.assign(&path);
    if let Some(module) = graph.get(&path) {
      for dep in &module.resolved_dependencies {
        if seen.insert(dep.clone()) {
          queue.push_back(dep.clone());
        }
      }
    }
  }
}
