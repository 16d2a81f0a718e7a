// Copyright 2024-2026 the Bungae authors. MIT license.

use std::collections::BTreeMap;
use std::fs;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use percent_encoding::utf8_percent_encode;
use percent_encoding::AsciiSet;
use percent_encoding::NON_ALPHANUMERIC;
use serde_json::Value;

use crate::config::BungaeConfig;
use crate::errors::AnyError;
use crate::fs_util;
use crate::graph::Graph;
use crate::graph::ModuleType;
use crate::module_id::ModuleId;
use crate::module_id::ModuleIdProvider;

/// RFC 3986 unreserved characters survive; everything else in a path
/// segment is percent-encoded, `%` itself included.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
  .remove(b'-')
  .remove(b'_')
  .remove(b'.')
  .remove(b'~');

pub const METRO_RUNTIME_POLYFILL: &str = include_str!("runtime/require.js");

/// A script prepended to the module list: the variable prelude, the
/// `__d`/`__r` runtime, and any configured polyfills.
#[derive(Debug, Clone)]
pub struct PreModule {
  pub path: PathBuf,
  pub module_type: ModuleType,
  pub code: String,
}

/// The serialized bundle: `pre + "\n" + modules.join("\n") + "\n" + post`.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
  pub pre: String,
  pub modules: Vec<(ModuleId, String)>,
  pub post: String,
  /// Graph path of each entry in `modules`, index-aligned. Not part of
  /// the byte layout; the source-map assembler and symbolication use it.
  pub module_paths: Vec<PathBuf>,
}

impl Bundle {
  pub fn to_bundle_string(&self) -> String {
    let modules = self
      .modules
      .iter()
      .map(|(_, code)| code.as_str())
      .collect::<Vec<_>>()
      .join("\n");
    format!("{}\n{}\n{}", self.pre, modules, self.post)
  }

  /// 0-based line of the first line of each module inside
  /// `to_bundle_string()` output.
  pub fn module_line_offsets(&self) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(self.modules.len());
    let mut line = count_lines(&self.pre);
    for (_, code) in &self.modules {
      offsets.push(line);
      line += count_lines(code);
    }
    offsets
  }
}

fn count_lines(text: &str) -> usize {
  text.split('\n').count()
}

pub fn default_run_module_statement(id: &ModuleId) -> String {
  format!("__r({});", id.to_json())
}

pub struct SerializerOptions {
  pub project_root: PathBuf,
  pub dev: bool,
  pub run_module: bool,
  /// Modules initialized before the entry, by path. `InitializeCore` is
  /// prepended implicitly when present in the graph.
  pub run_before_main_module: Vec<String>,
  pub source_map_url: Option<String>,
  pub source_url: Option<String>,
  pub inline_source_map: bool,
  pub get_run_module_statement: fn(&ModuleId) -> String,
  pub extra_vars: BTreeMap<String, Value>,
  pub global_prefix: String,
  pub require_cycle_ignore_patterns: Vec<String>,
}

impl Default for SerializerOptions {
  fn default() -> Self {
    Self {
      project_root: PathBuf::from("/"),
      dev: true,
      run_module: true,
      run_before_main_module: Vec::new(),
      source_map_url: None,
      source_url: None,
      inline_source_map: false,
      get_run_module_statement: default_run_module_statement,
      extra_vars: BTreeMap::new(),
      global_prefix: String::new(),
      require_cycle_ignore_patterns: Vec::new(),
    }
  }
}

impl SerializerOptions {
  pub fn from_config(config: &BungaeConfig) -> Self {
    Self {
      project_root: config.root.clone(),
      dev: config.dev,
      run_module: true,
      run_before_main_module: config.serializer.run_before_main_module.clone(),
      source_map_url: None,
      source_url: None,
      inline_source_map: config.serializer.inline_source_map,
      get_run_module_statement: default_run_module_statement,
      extra_vars: config.serializer.extra_vars.clone(),
      global_prefix: config.serializer.global_prefix.clone(),
      require_cycle_ignore_patterns: config
        .serializer
        .require_cycle_ignore_patterns
        .clone(),
    }
  }
}

/// Serializes a graph into the Metro `__d`/`__r` byte layout. Callers that
/// use numeric ids must populate the id factory (`graph::assign_ids`)
/// before serializing, so numbering follows the deterministic BFS order
/// rather than this function's iteration.
pub fn base_js_bundle(
  graph: &Graph,
  pre_modules: &[PreModule],
  ids: &mut dyn ModuleIdProvider,
  options: &SerializerOptions,
) -> Bundle {
  let pre = pre_modules
    .iter()
    .map(|m| m.code.as_str())
    .collect::<Vec<_>>()
    .join("\n");

  let mut entries: Vec<(ModuleId, &crate::graph::Module)> = graph
    .modules()
    .map(|module| (ids.id(&module.path), module))
    .collect();
  // Numeric ids are emitted in increasing order; string ids keep the
  // graph's insertion order (Metro iterates the graph map directly).
  if entries
    .iter()
    .all(|(id, _)| matches!(id, ModuleId::Number(_)))
  {
    entries.sort_by_key(|(id, _)| match id {
      ModuleId::Number(n) => *n,
      ModuleId::Name(_) => u64::MAX,
    });
  }

  let mut modules = Vec::with_capacity(entries.len());
  let mut module_paths = Vec::with_capacity(entries.len());
  for (id, module) in entries {
    let code = if module.module_type.is_script() {
      module.transformed_code.clone()
    } else {
      let dep_ids: Vec<ModuleId> = module
        .resolved_dependencies
        .iter()
        .map(|dep| ids.id(dep))
        .collect();
      let verbose_name = if options.dev {
        Some(fs_util::relative_path(&options.project_root, &module.path))
      } else {
        None
      };
      wrap_module(
        &module.transformed_code,
        &id,
        &dep_ids,
        verbose_name.as_deref(),
      )
    };
    module_paths.push(module.path.clone());
    modules.push((id, code));
  }

  let mut bundle = Bundle {
    pre,
    modules,
    post: String::new(),
    module_paths,
  };

  let source_map_url = if options.inline_source_map {
    Some(format!(
      "data:application/json;base64,{}",
      base64::encode(bundle_source_map(&bundle, graph))
    ))
  } else {
    options.source_map_url.clone()
  };

  bundle.post = append_scripts(graph, ids, options, source_map_url);
  bundle
}

/// The per-module `__d(...)` string. Pre-wrapped code (already opening
/// with `__d(`) gets its parameters spliced in before the final paren;
/// bare factory bodies are wrapped with the full parameter list.
pub fn wrap_module(
  code: &str,
  id: &ModuleId,
  dep_ids: &[ModuleId],
  verbose_name: Option<&str>,
) -> String {
  let deps = format!(
    "[{}]",
    dep_ids
      .iter()
      .map(|dep| dep.to_json())
      .collect::<Vec<_>>()
      .join(",")
  );
  let mut params = vec![id.to_json(), deps];
  if let Some(name) = verbose_name {
    params.push(Value::String(name.to_string()).to_string());
  }
  let params = params.join(",");

  if code.trim_start().starts_with("__d(") {
    add_params_to_define_call(code, &params)
  } else {
    format!(
      "__d(function(global, require, metroImportDefault, metroImportAll, module, exports, dependencyMap) {{\n{}\n}},{});",
      code, params
    )
  }
}

/// Splices `,params` in front of the final closing paren of a `__d(...)`
/// call, leaving everything else byte-identical.
pub fn add_params_to_define_call(code: &str, params: &str) -> String {
  match code.rfind(')') {
    Some(index) => {
      format!("{},{}{}", &code[..index], params, &code[index..])
    }
    None => code.to_string(),
  }
}

fn append_scripts(
  graph: &Graph,
  ids: &mut dyn ModuleIdProvider,
  options: &SerializerOptions,
  source_map_url: Option<String>,
) -> String {
  let mut lines: Vec<String> = Vec::new();
  let mut ran: Vec<PathBuf> = Vec::new();

  let mut run_before: Vec<String> = Vec::new();
  if let Some(init_core) = graph.paths().find(|path| {
    ends_with_segments(path, &["Libraries", "Core", "InitializeCore.js"])
  }) {
    run_before.push(init_core.to_string_lossy().into_owned());
  }
  run_before.extend(options.run_before_main_module.iter().cloned());

  for entry in &run_before {
    if let Some(path) = find_in_graph(graph, entry, &options.project_root) {
      if ran.contains(&path) {
        continue;
      }
      lines.push((options.get_run_module_statement)(&ids.id(&path)));
      ran.push(path);
    }
  }

  if options.run_module {
    let entry = graph.entry().to_path_buf();
    lines.push((options.get_run_module_statement)(&ids.id(&entry)));
  }
  if let Some(url) = source_map_url {
    lines.push(format!(
      "//# sourceMappingURL={}",
      percent_encode_url_path(&url)
    ));
  }
  if let Some(url) = &options.source_url {
    lines.push(format!("//# sourceURL={}", percent_encode_url_path(url)));
  }
  lines.join("\n")
}

/// Locates a configured path in the graph: exact key, normalized absolute
/// against the project root, then a last-three-segments suffix match.
fn find_in_graph(
  graph: &Graph,
  entry: &str,
  project_root: &Path,
) -> Option<PathBuf> {
  let as_path = Path::new(entry);
  if graph.contains(as_path) {
    return Some(as_path.to_path_buf());
  }
  let normalized = fs_util::normalize_path(project_root.join(entry));
  if graph.contains(&normalized) {
    return Some(normalized);
  }
  let segments: Vec<&str> = entry
    .split('/')
    .filter(|s| !s.is_empty())
    .rev()
    .take(3)
    .collect();
  let segments: Vec<&str> = segments.into_iter().rev().collect();
  if segments.is_empty() {
    return None;
  }
  graph
    .paths()
    .find(|path| ends_with_segments(path, &segments))
    .cloned()
}

fn ends_with_segments(path: &Path, segments: &[&str]) -> bool {
  let components: Vec<&str> = path
    .components()
    .filter_map(|c| match c {
      Component::Normal(s) => s.to_str(),
      _ => None,
    })
    .collect();
  components.len() >= segments.len()
    && components[components.len() - segments.len()..] == segments[..]
}

/// Percent-encodes every path segment of a URL (or bare path), leaving the
/// scheme and authority untouched. `data:` URLs pass through.
pub fn percent_encode_url_path(url: &str) -> String {
  if url.starts_with("data:") {
    return url.to_string();
  }
  let (prefix, path) = match url.find("://") {
    Some(scheme_end) => {
      let after = scheme_end + 3;
      match url[after..].find('/') {
        Some(slash) => url.split_at(after + slash),
        None => return url.to_string(),
      }
    }
    None => ("", url),
  };
  let encoded = path
    .split('/')
    .map(|segment| utf8_percent_encode(segment, PATH_SEGMENT).to_string())
    .collect::<Vec<_>>()
    .join("/");
  format!("{}{}", prefix, encoded)
}

/// Index source map for the whole bundle, built from the per-module maps
/// at their line offsets in the serialized output.
pub fn bundle_source_map(bundle: &Bundle, graph: &Graph) -> String {
  let offsets = bundle.module_line_offsets();
  let mut sections = Vec::new();
  for (index, path) in bundle.module_paths.iter().enumerate() {
    let Some(module) = graph.get(path) else {
      continue;
    };
    let Some(map_text) = &module.source_map else {
      continue;
    };
    let Ok(map) = serde_json::from_str::<Value>(map_text) else {
      continue;
    };
    sections.push(serde_json::json!({
      "offset": { "line": offsets[index], "column": 0 },
      "map": map,
    }));
  }
  serde_json::json!({ "version": 3, "sections": sections }).to_string()
}

/// The scripts in front of the module list: the variable prelude, the
/// embedded `__d`/`__r` runtime (already a complete IIFE, emitted as-is),
/// and each configured polyfill wrapped in an IIFE.
pub fn get_prepended_modules(
  config: &BungaeConfig,
  options: &SerializerOptions,
) -> Result<Vec<PreModule>, AnyError> {
  let prelude_code = match &config.serializer.prelude {
    Some(prelude) => {
      let path = if prelude.is_absolute() {
        prelude.clone()
      } else {
        config.root.join(prelude)
      };
      fs::read_to_string(path)?
    }
    None => build_prelude(options),
  };
  let mut pre = vec![
    PreModule {
      path: PathBuf::from("__prelude__"),
      module_type: ModuleType::ScriptVirtual,
      code: prelude_code,
    },
    PreModule {
      path: PathBuf::from("metro-runtime/require.js"),
      module_type: ModuleType::Script,
      code: METRO_RUNTIME_POLYFILL.to_string(),
    },
  ];
  for polyfill in &config.serializer.polyfills {
    let path = if polyfill.is_absolute() {
      polyfill.clone()
    } else {
      config.root.join(polyfill)
    };
    let code = fs::read_to_string(&path)?;
    pre.push(PreModule {
      path,
      module_type: ModuleType::Script,
      code: wrap_polyfill(&code),
    });
  }
  Ok(pre)
}

fn build_prelude(options: &SerializerOptions) -> String {
  let node_env = if options.dev { "development" } else { "production" };
  let mut vars = vec![
    "__BUNDLE_START_TIME__=this.nativePerformanceNow?nativePerformanceNow():Date.now()"
      .to_string(),
    format!("__DEV__={}", options.dev),
    "process=this.process||{}".to_string(),
    format!(
      "__METRO_GLOBAL_PREFIX__={}",
      Value::String(options.global_prefix.clone())
    ),
  ];
  for (name, value) in &options.extra_vars {
    vars.push(format!("{}={}", name, value));
  }
  let mut code = format!("var {};", vars.join(","));
  code.push_str(&format!(
    "process.env=process.env||{{}};process.env.NODE_ENV=process.env.NODE_ENV||{};",
    Value::String(node_env.to_string())
  ));
  if !options.require_cycle_ignore_patterns.is_empty() {
    let patterns = options
      .require_cycle_ignore_patterns
      .iter()
      .map(|p| format!("new RegExp({})", Value::String(p.clone())))
      .collect::<Vec<_>>()
      .join(",");
    code.push_str(&format!("var __requireCycleIgnorePatterns=[{}];", patterns));
  }
  code
}

pub fn wrap_polyfill(code: &str) -> String {
  format!(
    "(function(global) {{\n{}\n}})(typeof globalThis !== 'undefined' ? globalThis : typeof global !== 'undefined' ? global : typeof window !== 'undefined' ? window : this);",
    code
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::graph::Module;
  use pretty_assertions::assert_eq;
  use std::collections::BTreeSet;

  /// Metro's test fixtures create module ids from the file basename.
  struct BasenameIds;

  impl ModuleIdProvider for BasenameIds {
    fn id(&mut self, path: &Path) -> ModuleId {
      ModuleId::Name(
        path
          .file_name()
          .map(|s| s.to_string_lossy().into_owned())
          .unwrap_or_default(),
      )
    }
  }

  fn module(path: &str, code: &str, deps: &[&str]) -> Module {
    Module {
      path: PathBuf::from(path),
      module_type: crate::graph::ModuleType::Module,
      original_specifiers: deps.iter().map(|d| d.to_string()).collect(),
      resolved_dependencies: deps.iter().map(PathBuf::from).collect(),
      inverse_dependencies: BTreeSet::new(),
      transformed_code: code.to_string(),
      source_map: None,
      content_hash: String::new(),
    }
  }

  fn fixture_graph() -> Graph {
    let mut graph = Graph::new(PathBuf::from("/root/foo"));
    graph.insert(module(
      "/root/foo",
      "__d(function() {/* code for foo */});",
      &["/root/bar"],
    ));
    graph.insert(module(
      "/root/bar",
      "__d(function() {/* code for bar */});",
      &[],
    ));
    graph
  }

  fn fixture_pre() -> Vec<PreModule> {
    vec![PreModule {
      path: PathBuf::from("/root/polyfill"),
      module_type: ModuleType::Script,
      code: "__d(function() {/* code for polyfill */});".to_string(),
    }]
  }

  fn require_statement(id: &ModuleId) -> String {
    format!("require({});", id.to_json())
  }

  fn fixture_options() -> SerializerOptions {
    SerializerOptions {
      project_root: PathBuf::from("/root"),
      dev: true,
      run_module: true,
      source_map_url: Some("http://localhost/bundle.map".to_string()),
      get_run_module_statement: require_statement,
      ..Default::default()
    }
  }

  #[test]
  fn test_base_bundle_fixture() {
    let graph = fixture_graph();
    let bundle = base_js_bundle(
      &graph,
      &fixture_pre(),
      &mut BasenameIds,
      &fixture_options(),
    );

    assert_eq!(bundle.pre, "__d(function() {/* code for polyfill */});");
    assert_eq!(
      bundle.modules[0].1,
      "__d(function() {/* code for foo */},\"foo\",[\"bar\"],\"foo\");"
    );
    assert_eq!(
      bundle.modules[1].1,
      "__d(function() {/* code for bar */},\"bar\",[],\"bar\");"
    );
    assert_eq!(
      bundle.post,
      "require(\"foo\");\n//# sourceMappingURL=http://localhost/bundle.map"
    );
  }

  #[test]
  fn test_run_before_main_module() {
    let graph = fixture_graph();
    let mut options = fixture_options();
    options.run_before_main_module =
      vec!["/root/bar".to_string(), "non-existent".to_string()];
    let bundle =
      base_js_bundle(&graph, &fixture_pre(), &mut BasenameIds, &options);
    assert_eq!(
      bundle.post,
      "require(\"bar\");\nrequire(\"foo\");\n//# sourceMappingURL=http://localhost/bundle.map"
    );
  }

  #[test]
  fn test_non_ascii_paths_are_percent_encoded() {
    let path = "/root/%30.\u{431}\u{443}\u{43d}\u{434}\u{43b}.\u{d8}\u{c9A}\u{1F601}AA/src/?/foo=bar/#.js";
    let mut graph = Graph::new(PathBuf::from(path));
    graph.insert(module(path, "__d(function() {/* code for foo */});", &[]));
    let mut options = fixture_options();
    options.source_map_url =
      Some(format!("http://localhost{}", path.replace(".js", ".map")));
    options.source_url = Some(format!("http://localhost{}", path));
    let bundle = base_js_bundle(&graph, &[], &mut BasenameIds, &options);

    let verbose = "%30.\u{431}\u{443}\u{43d}\u{434}\u{43b}.\u{d8}\u{c9A}\u{1F601}AA/src/?/foo=bar/#.js";
    assert_eq!(
      bundle.modules[0].1,
      format!(
        "__d(function() {{/* code for foo */}},\"#.js\",[],\"{}\");",
        verbose
      )
    );
    assert!(bundle.post.contains("sourceMappingURL="));
    assert!(bundle.post.contains("%2530"));
    assert!(bundle.post.contains("%D0%B1"));
    assert!(bundle.post.contains("%3F"));
    assert!(bundle.post.contains("%23.js"));
    assert!(!bundle.post.contains("/?/"));
  }

  #[test]
  fn test_dependency_ids_follow_specifier_order() {
    let mut graph = Graph::new(PathBuf::from("/root/main"));
    graph.insert(module("/root/main", "code", &["/root/z", "/root/a"]));
    graph.insert(module("/root/z", "z", &[]));
    graph.insert(module("/root/a", "a", &[]));
    let bundle = base_js_bundle(
      &graph,
      &[],
      &mut BasenameIds,
      &fixture_options(),
    );
    assert!(bundle.modules[0].1.contains("[\"z\",\"a\"]"));
  }

  #[test]
  fn test_serialization_is_deterministic() {
    let graph = fixture_graph();
    let first = base_js_bundle(
      &graph,
      &fixture_pre(),
      &mut BasenameIds,
      &fixture_options(),
    );
    let second = base_js_bundle(
      &graph,
      &fixture_pre(),
      &mut BasenameIds,
      &fixture_options(),
    );
    assert_eq!(first.to_bundle_string(), second.to_bundle_string());
  }

  #[test]
  fn test_numeric_ids_emit_in_increasing_order() {
    use crate::module_id::ModuleIdFactory;
    let mut graph = Graph::new(PathBuf::from("/root/main.js"));
    graph.insert(module("/root/main.js", "m", &["/root/dep.js"]));
    graph.insert(module("/root/dep.js", "d", &[]));
    let mut factory = ModuleIdFactory::new();
    crate::graph::assign_ids(&graph, &mut factory);
    let mut options = fixture_options();
    options.get_run_module_statement = default_run_module_statement;
    let bundle = base_js_bundle(&graph, &[], &mut factory, &options);
    assert_eq!(bundle.modules[0].0, ModuleId::Number(0));
    assert_eq!(bundle.modules[1].0, ModuleId::Number(1));
    assert!(bundle.post.starts_with("__r(0);"));
  }

  #[test]
  fn test_wrap_module_bare_body() {
    let wrapped = wrap_module(
      "const a = require(dependencyMap[0]);",
      &ModuleId::Number(3),
      &[ModuleId::Number(7)],
      Some("src/a.js"),
    );
    assert!(wrapped.starts_with(
      "__d(function(global, require, metroImportDefault, metroImportAll, module, exports, dependencyMap) {"
    ));
    assert!(wrapped.ends_with("},3,[7],\"src/a.js\");"));
  }

  #[test]
  fn test_add_params_to_define_call() {
    assert_eq!(
      add_params_to_define_call("__d(function() {});", "0,[]"),
      "__d(function() {},0,[]);"
    );
  }

  #[test]
  fn test_initialize_core_is_implicit() {
    let mut graph = Graph::new(PathBuf::from("/root/index.js"));
    graph.insert(module(
      "/root/index.js",
      "__d(function() {});",
      &["/root/node_modules/react-native/Libraries/Core/InitializeCore.js"],
    ));
    graph.insert(module(
      "/root/node_modules/react-native/Libraries/Core/InitializeCore.js",
      "__d(function() {});",
      &[],
    ));
    let mut options = fixture_options();
    options.source_map_url = None;
    let bundle =
      base_js_bundle(&graph, &[], &mut BasenameIds, &options);
    assert_eq!(
      bundle.post,
      "require(\"InitializeCore.js\");\nrequire(\"index.js\");"
    );
  }

  #[test]
  fn test_inline_source_map() {
    let mut graph = Graph::new(PathBuf::from("/root/foo"));
    let mut with_map = module("/root/foo", "code", &[]);
    with_map.source_map =
      Some("{\"version\":3,\"mappings\":\"AAAA\"}".to_string());
    graph.insert(with_map);
    let mut options = fixture_options();
    options.inline_source_map = true;
    let bundle = base_js_bundle(&graph, &[], &mut BasenameIds, &options);
    assert!(bundle
      .post
      .contains("sourceMappingURL=data:application/json;base64,"));
  }

  #[test]
  fn test_bundle_source_map_offsets() {
    let mut graph = Graph::new(PathBuf::from("/root/foo"));
    let mut first = module("/root/foo", "line1\nline2", &[]);
    first.source_map =
      Some("{\"version\":3,\"mappings\":\"AAAA\"}".to_string());
    let mut second = module("/root/bar", "line1", &[]);
    second.source_map =
      Some("{\"version\":3,\"mappings\":\"AAAA\"}".to_string());
    graph.insert(first);
    graph.insert(second);
    let mut options = fixture_options();
    options.source_map_url = None;
    let bundle = base_js_bundle(
      &graph,
      &fixture_pre(),
      &mut BasenameIds,
      &options,
    );
    let map: Value =
      serde_json::from_str(&bundle_source_map(&bundle, &graph)).unwrap();
    let sections = map["sections"].as_array().unwrap();
    assert_eq!(sections.len(), 2);
    // The single-line fixture pre module pushes the first section to 1.
    assert_eq!(sections[0]["offset"]["line"], 1);
    assert!(sections[1]["offset"]["line"].as_u64().unwrap() > 1);
  }

  #[test]
  fn test_percent_encode_url_path() {
    assert_eq!(
      percent_encode_url_path("http://localhost/bundle.map"),
      "http://localhost/bundle.map"
    );
    assert_eq!(
      percent_encode_url_path("http://localhost/%30/a b"),
      "http://localhost/%2530/a%20b"
    );
    assert!(percent_encode_url_path("data:application/json;base64,AA==")
      .starts_with("data:"));
  }

  #[test]
  fn test_prelude_contents() {
    let mut options = fixture_options();
    options
      .extra_vars
      .insert("__EXTRA__".to_string(), serde_json::json!(1));
    options.require_cycle_ignore_patterns = vec!["node_modules".to_string()];
    let prelude = build_prelude(&options);
    assert!(prelude.contains("__DEV__=true"));
    assert!(prelude.contains("__METRO_GLOBAL_PREFIX__=\"\""));
    assert!(prelude.contains("__EXTRA__=1"));
    assert!(prelude
      .contains("process.env.NODE_ENV=process.env.NODE_ENV||\"development\""));
    assert!(prelude
      .contains("var __requireCycleIgnorePatterns=[new RegExp(\"node_modules\")];"));
  }

  #[test]
  fn test_get_prepended_modules() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path();
    std::fs::write(root.join("poly.js"), "global.x = 1;").unwrap();
    let mut config = crate::config::BungaeConfig::default();
    config.root = root.to_path_buf();
    config.serializer.polyfills = vec![PathBuf::from("poly.js")];
    let options = SerializerOptions::from_config(&config);
    let pre = get_prepended_modules(&config, &options).unwrap();
    assert_eq!(pre.len(), 3);
    assert_eq!(pre[0].module_type, ModuleType::ScriptVirtual);
    assert!(pre[0].code.starts_with("var "));
    // The runtime ships pre-wrapped and is emitted as-is.
    assert!(pre[1].code.contains("global.__d"));
    assert!(pre[2].code.starts_with("(function(global) {"));
    assert!(pre[2].code.contains("global.x = 1;"));
  }

  #[test]
  fn test_wrap_polyfill() {
    let wrapped = wrap_polyfill("console.log(1);");
    assert!(wrapped.starts_with("(function(global) {"));
    assert!(wrapped.contains("console.log(1);"));
    assert!(wrapped.ends_with("this);"));
  }
}
