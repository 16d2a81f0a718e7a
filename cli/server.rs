// Copyright 2024-2026 the Bungae authors. MIT license.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context as _;
use bytes::Bytes;
use fastwebsockets::upgrade::UpgradeFut;
use fastwebsockets::FragmentCollector;
use fastwebsockets::Frame;
use fastwebsockets::OpCode;
use fastwebsockets::Payload;
use futures::StreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::Method;
use hyper::Request;
use hyper::Response;
use hyper::StatusCode;
use hyper_util::rt::TokioIo;
use log::debug;
use log::error;
use log::info;
use log::warn;
use serde_json::json;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::colors;
use crate::config::BungaeConfig;
use crate::config::Platform;
use crate::disk_cache::TransformCache;
use crate::errors::AnyError;
use crate::errors::ResolutionError;
use crate::errors::TransformError;
use crate::file_watcher;
use crate::graph::CancelFlag;
use crate::graph::Graph;
use crate::graph::GraphBuilder;
use crate::hmr;
use crate::incremental::incremental_build;
use crate::incremental::BuildState;
use crate::incremental::Delta;
use crate::module_id::ModuleIdFactory;
use crate::resolver;
use crate::serializer;
use crate::serializer::Bundle;
use crate::serializer::SerializerOptions;

type Body = UnsyncBoxBody<Bytes, std::convert::Infallible>;
type HandlerResponse = Response<Body>;

const ASSET_CACHE_CONTROL: &str = "public, max-age=31536000";

/// Consecutive `accept()` failures tolerated before the listener is
/// considered broken and the server shuts down.
const MAX_ACCEPT_FAILURES: u32 = 10;

fn body_of(bytes: impl Into<Bytes>) -> Body {
  Full::new(bytes.into()).boxed_unsync()
}

fn response(
  status: StatusCode,
  content_type: &str,
  bytes: impl Into<Bytes>,
) -> HandlerResponse {
  Response::builder()
    .status(status)
    .header("Content-Type", content_type)
    .body(body_of(bytes))
    .unwrap_or_else(|_| Response::new(body_of(Bytes::new())))
}

fn text_response(status: StatusCode, text: impl Into<Bytes>) -> HandlerResponse {
  response(status, "text/plain; charset=utf-8", text)
}

/// How source paths appear in emitted source maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourcePaths {
  Absolute,
  UrlServer,
}

/// Parameters of a `/<name>.bundle` (or `.map`) request.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleParams {
  pub name: String,
  pub platform: Platform,
  pub dev: bool,
  pub minify: bool,
  pub run_module: bool,
  pub modules_only: bool,
  pub exclude_source: bool,
  pub inline_source_map: bool,
  pub source_paths: SourcePaths,
}

impl BundleParams {
  pub fn from_request(
    path: &str,
    query: &str,
    config: &BungaeConfig,
  ) -> Option<Self> {
    let name = path.strip_prefix('/')?;
    let name = name
      .strip_suffix(".bundle.js")
      .or_else(|| name.strip_suffix(".bundle"))
      .or_else(|| name.strip_suffix(".map"))?
      .to_string();
    if name.is_empty() || name.contains('/') {
      return None;
    }

    let params = parse_query(query);
    let get_bool = |key: &str, default: bool| -> bool {
      params
        .get(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
    };
    let platform = match params.get("platform") {
      Some(p) => p.parse().ok()?,
      None => config.platform,
    };
    let source_paths = match params.get("sourcePaths").map(|s| s.as_str()) {
      Some("url-server") => SourcePaths::UrlServer,
      _ => SourcePaths::Absolute,
    };
    Some(Self {
      name,
      platform,
      dev: get_bool("dev", config.dev),
      minify: get_bool("minify", config.minify),
      run_module: get_bool("runModule", true),
      modules_only: get_bool("modulesOnly", false),
      exclude_source: get_bool("excludeSource", false),
      inline_source_map: get_bool("inlineSourceMap", false),
      source_paths,
    })
  }

  /// Cache key for retained builds; one build state per distinct
  /// parameter set.
  pub fn key(&self) -> String {
    format!(
      "{}|{}|dev={}|minify={}",
      self.name, self.platform, self.dev, self.minify
    )
  }
}

fn parse_query(query: &str) -> HashMap<String, String> {
  query
    .split('&')
    .filter(|pair| !pair.is_empty())
    .filter_map(|pair| {
      let mut parts = pair.splitn(2, '=');
      let key = parts.next()?;
      let value = parts.next().unwrap_or("");
      Some((key.to_string(), value.to_string()))
    })
    .collect()
}

struct BuildRecord {
  params: BundleParams,
  config: Arc<BungaeConfig>,
  state: BuildState,
  bundle: Bundle,
}

struct HmrClient {
  sender: mpsc::UnboundedSender<String>,
}

struct Inner {
  config: Arc<BungaeConfig>,
  cache: Option<Arc<TransformCache>>,
  /// Retained builds, keyed by bundle parameters. The async mutex also
  /// serializes full and incremental builds; batches arriving while a
  /// rebuild runs queue up behind it.
  builds: tokio::sync::Mutex<HashMap<String, BuildRecord>>,
  hmr_clients: parking_lot::Mutex<HashMap<u64, HmrClient>>,
  message_clients:
    parking_lot::Mutex<HashMap<u64, mpsc::UnboundedSender<String>>>,
  next_client_id: AtomicU64,
}

impl Inner {
  fn broadcast_hmr(&self, message: &Value) {
    let text = message.to_string();
    let mut clients = self.hmr_clients.lock();
    clients.retain(|_, client| client.sender.send(text.clone()).is_ok());
  }

  fn broadcast_message(&self, message: &Value, skip: Option<u64>) {
    let text = message.to_string();
    let mut clients = self.message_clients.lock();
    clients.retain(|id, sender| {
      if skip == Some(*id) {
        return true;
      }
      sender.send(text.clone()).is_ok()
    });
  }
}

pub struct DevServer {
  inner: Arc<Inner>,
}

impl DevServer {
  pub fn new(config: BungaeConfig) -> Self {
    let config = Arc::new(config);
    let cache = if config.cache.enabled {
      Some(Arc::new(TransformCache::new(
        config.cache_dir(),
        config.cache.max_age_secs,
      )))
    } else {
      None
    };
    Self {
      inner: Arc::new(Inner {
        config,
        cache,
        builds: tokio::sync::Mutex::new(HashMap::new()),
        hmr_clients: parking_lot::Mutex::new(HashMap::new()),
        message_clients: parking_lot::Mutex::new(HashMap::new()),
        next_client_id: AtomicU64::new(0),
      }),
    }
  }

  pub async fn run(self) -> Result<(), AnyError> {
    let port = self.inner.config.server.port;
    if self.inner.config.dev {
      spawn_watch_task(self.inner.clone());
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
      .await
      .with_context(|| format!("failed to bind port {}", port))?;
    info!(
      "{} Dev server ready at http://localhost:{}",
      colors::green("Bungae"),
      port
    );

    let mut accept_failures: u32 = 0;
    loop {
      tokio::select! {
        accepted = listener.accept() => {
          let (stream, _) = match accepted {
            Ok(accepted) => {
              accept_failures = 0;
              accepted
            }
            Err(err) => {
              // EMFILE and ECONNABORTED are transient; only a listener
              // that keeps failing takes the server down.
              accept_failures += 1;
              if accept_failures >= MAX_ACCEPT_FAILURES {
                return Err(err).context("listener failed repeatedly");
              }
              warn!("failed to accept connection: {}", err);
              tokio::time::sleep(std::time::Duration::from_millis(50)).await;
              continue;
            }
          };
          let io = TokioIo::new(stream);
          let inner = self.inner.clone();
          tokio::spawn(async move {
            let service = hyper::service::service_fn(move |req| {
              let inner = inner.clone();
              async move { handle(inner, req).await }
            });
            let conn = hyper::server::conn::http1::Builder::new()
              .serve_connection(io, service)
              .with_upgrades();
            if let Err(err) = conn.await {
              debug!("connection error: {}", err);
            }
          });
        }
        _ = tokio::signal::ctrl_c() => {
          info!("{} Shutting down...", colors::gray("Server"));
          // Dropping the senders tells every websocket task to close;
          // graceful close is bounded at two seconds.
          let inner = self.inner.clone();
          let shutdown = async move {
            inner.hmr_clients.lock().clear();
            inner.message_clients.lock().clear();
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
          };
          let _ = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            shutdown,
          )
          .await;
          return Ok(());
        }
      }
    }
  }
}

async fn handle(
  inner: Arc<Inner>,
  req: Request<Incoming>,
) -> Result<HandlerResponse, std::convert::Infallible> {
  let path = req.uri().path().to_string();
  let result = route(inner, req).await;
  Ok(result.unwrap_or_else(|err| {
    error!("{} {}: {:#}", colors::red_bold("error"), path, err);
    text_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", err))
  }))
}

async fn route(
  inner: Arc<Inner>,
  mut req: Request<Incoming>,
) -> Result<HandlerResponse, AnyError> {
  let path = req.uri().path().to_string();
  let query = req.uri().query().unwrap_or("").to_string();

  match path.as_str() {
    "/status" => Ok(text_response(
      StatusCode::OK,
      "packager-status:running",
    )),
    "/hot" => handle_websocket(inner, &mut req, query, WebSocketKind::Hmr),
    "/message" => {
      handle_websocket(inner, &mut req, query, WebSocketKind::Message)
    }
    "/symbolicate" => handle_symbolicate(inner, req).await,
    "/reload" | "/devmenu" => {
      if req.method() != Method::POST {
        return Ok(text_response(
          StatusCode::METHOD_NOT_ALLOWED,
          "method not allowed",
        ));
      }
      let method = if path == "/reload" { "reload" } else { "devMenu" };
      inner.broadcast_message(&json!({ "method": method }), None);
      Ok(text_response(StatusCode::OK, "OK"))
    }
    _ if path.starts_with("/assets/") => {
      let rel = path.trim_start_matches("/assets/");
      Ok(serve_asset(&inner.config, rel, AssetBase::ProjectRoot))
    }
    _ if path.starts_with("/node_modules/") => {
      let rel = path.trim_start_matches("/node_modules/");
      Ok(serve_asset(&inner.config, rel, AssetBase::NodeModules))
    }
    _ if path.ends_with(".bundle") || path.ends_with(".bundle.js") => {
      let Some(params) =
        BundleParams::from_request(&path, &query, &inner.config)
      else {
        return Ok(text_response(StatusCode::BAD_REQUEST, "invalid bundle url"));
      };
      let text = bundle_text(&inner, &params).await?;
      Ok(response(StatusCode::OK, "application/javascript", text))
    }
    _ if path.ends_with(".map") => {
      let Some(params) =
        BundleParams::from_request(&path, &query, &inner.config)
      else {
        return Ok(text_response(StatusCode::BAD_REQUEST, "invalid map url"));
      };
      let map = source_map_text(&inner, &params).await?;
      Ok(response(StatusCode::OK, "application/json", map))
    }
    _ => Ok(text_response(StatusCode::NOT_FOUND, "not found")),
  }
}

// ---------------------------------------------------------------------------
// Bundles

async fn bundle_text(
  inner: &Arc<Inner>,
  params: &BundleParams,
) -> Result<String, AnyError> {
  let mut builds = inner.builds.lock().await;
  let record = ensure_build(inner, &mut builds, params).await?;
  let text = if params.modules_only {
    record
      .bundle
      .modules
      .iter()
      .map(|(_, code)| code.as_str())
      .collect::<Vec<_>>()
      .join("\n")
  } else {
    record.bundle.to_bundle_string()
  };
  if params.minify {
    return minify_bundle(&inner.config.minifier, text).await;
  }
  Ok(text)
}

async fn source_map_text(
  inner: &Arc<Inner>,
  params: &BundleParams,
) -> Result<String, AnyError> {
  let mut builds = inner.builds.lock().await;
  let record = ensure_build(inner, &mut builds, params).await?;
  let map =
    serializer::bundle_source_map(&record.bundle, &record.state.graph);
  if params.exclude_source || params.source_paths == SourcePaths::UrlServer {
    let mut parsed: Value = serde_json::from_str(&map)?;
    rewrite_map_sources(&mut parsed, params, &inner.config.root);
    return Ok(parsed.to_string());
  }
  Ok(map)
}

/// Applies the `excludeSource` and `sourcePaths=url-server` query options
/// to every section of an index map.
fn rewrite_map_sources(map: &mut Value, params: &BundleParams, root: &Path) {
  let Some(sections) = map.get_mut("sections").and_then(|s| s.as_array_mut())
  else {
    return;
  };
  for section in sections {
    let Some(section_map) = section.get_mut("map") else {
      continue;
    };
    if params.exclude_source {
      if let Some(object) = section_map.as_object_mut() {
        object.remove("sourcesContent");
      }
    }
    if params.source_paths == SourcePaths::UrlServer {
      if let Some(sources) =
        section_map.get_mut("sources").and_then(|s| s.as_array_mut())
      {
        for source in sources {
          if let Some(path) = source.as_str() {
            *source = Value::String(format!(
              "/{}",
              crate::fs_util::relative_path(root, Path::new(path))
            ));
          }
        }
      }
    }
  }
}

/// Builds (or re-serializes) the bundle for a parameter set. Full builds
/// happen on the first request; afterwards the retained state is
/// re-serialized, which the incremental pipeline keeps fresh.
async fn ensure_build<'a>(
  inner: &Arc<Inner>,
  builds: &'a mut HashMap<String, BuildRecord>,
  params: &BundleParams,
) -> Result<&'a mut BuildRecord, AnyError> {
  let key = params.key();
  if !builds.contains_key(&key) {
    let config = config_for(params, &inner.config);
    let builder = GraphBuilder::new(config.clone(), inner.cache.clone());
    let entry = builder
      .resolver()
      .resolve(&format!("./{}", params.name), &config.root)
      .map_err(AnyError::from)?;
    info!(
      "{} Building {} for {}...",
      colors::green("Bundle"),
      params.name,
      params.platform
    );
    let graph = builder.build(&entry, &CancelFlag::default()).await?;
    let state = BuildState::new(graph, ModuleIdFactory::new());
    let mut record = BuildRecord {
      params: params.clone(),
      config,
      state,
      bundle: Bundle {
        pre: String::new(),
        modules: Vec::new(),
        post: String::new(),
        module_paths: Vec::new(),
      },
    };
    serialize_record(&mut record)?;
    builds.insert(key.clone(), record);
  } else if let Some(record) = builds.get_mut(&key) {
    serialize_record(record)?;
  }
  builds
    .get_mut(&key)
    .ok_or_else(|| anyhow!("build record disappeared"))
}

fn config_for(params: &BundleParams, base: &BungaeConfig) -> Arc<BungaeConfig> {
  let mut config = base.clone();
  config.platform = params.platform;
  config.dev = params.dev;
  config.minify = params.minify;
  Arc::new(config)
}

fn serialize_record(record: &mut BuildRecord) -> Result<(), AnyError> {
  let params = &record.params;
  let port = record.config.server.port;
  let suffix = format!(
    "platform={}&dev={}&minify={}",
    params.platform, params.dev, params.minify
  );
  let mut options = SerializerOptions::from_config(&record.config);
  options.run_module = params.run_module;
  options.inline_source_map =
    params.inline_source_map || options.inline_source_map;
  options.source_map_url = Some(format!(
    "http://localhost:{}/{}.map?{}",
    port, params.name, suffix
  ));
  options.source_url = Some(format!(
    "http://localhost:{}/{}.bundle?{}",
    port, params.name, suffix
  ));

  let pre = serializer::get_prepended_modules(&record.config, &options)?;
  record.bundle = serializer::base_js_bundle(
    &record.state.graph,
    &pre,
    &mut record.state.id_factory,
    &options,
  );
  Ok(())
}

/// Pipes the bundle through the configured external minifier.
pub(crate) async fn minify_bundle(
  minifier: &str,
  code: String,
) -> Result<String, AnyError> {
  let mut child = tokio::process::Command::new(minifier)
    .arg("--compress")
    .arg("--mangle")
    .stdin(std::process::Stdio::piped())
    .stdout(std::process::Stdio::piped())
    .stderr(std::process::Stdio::piped())
    .spawn()
    .with_context(|| format!("failed to spawn minifier \"{}\"", minifier))?;
  if let Some(mut stdin) = child.stdin.take() {
    stdin.write_all(code.as_bytes()).await?;
  }
  let output = child.wait_with_output().await?;
  if !output.status.success() {
    return Err(anyhow!(
      "minifier \"{}\" failed: {}",
      minifier,
      String::from_utf8_lossy(&output.stderr)
    ));
  }
  Ok(String::from_utf8(output.stdout)?)
}

// ---------------------------------------------------------------------------
// Assets

#[derive(Debug, Clone, Copy, PartialEq)]
enum AssetBase {
  ProjectRoot,
  NodeModules,
}

fn serve_asset(
  config: &BungaeConfig,
  rel: &str,
  base: AssetBase,
) -> HandlerResponse {
  let decoded = percent_encoding::percent_decode_str(rel)
    .decode_utf8_lossy()
    .into_owned();
  match resolve_asset_path(config, &decoded, base) {
    Ok(Some(path)) => match std::fs::read(&path) {
      Ok(bytes) => Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", content_type_for(&path))
        .header("Cache-Control", ASSET_CACHE_CONTROL)
        .body(body_of(bytes))
        .unwrap_or_else(|_| Response::new(body_of(Bytes::new()))),
      Err(_) => text_response(StatusCode::NOT_FOUND, "not found"),
    },
    Ok(None) => text_response(StatusCode::NOT_FOUND, "not found"),
    Err(_) => text_response(StatusCode::FORBIDDEN, "forbidden"),
  }
}

/// Resolves an asset request to a file, enforcing that the canonical path
/// stays inside the project root or a configured node_modules root.
/// `Ok(None)` means missing (404); `Err` means escape attempt (403).
fn resolve_asset_path(
  config: &BungaeConfig,
  rel: &str,
  base: AssetBase,
) -> Result<Option<PathBuf>, AnyError> {
  let base_dir = match base {
    AssetBase::ProjectRoot => config.root.clone(),
    AssetBase::NodeModules => config.root.join("node_modules"),
  };

  let mut candidates = vec![base_dir.join(rel)];
  if base == AssetBase::NodeModules {
    // Requests into pnpm/Bun stores go through the same layout lookup the
    // resolver uses.
    let rel_path = Path::new(rel);
    let mut components = rel_path.components();
    if let Some(first) = components.next() {
      let mut package = first.as_os_str().to_string_lossy().into_owned();
      let mut remainder = components.as_path().to_path_buf();
      if package.starts_with('@') {
        if let Some(second) = remainder.components().next() {
          package = format!(
            "{}/{}",
            package,
            second.as_os_str().to_string_lossy()
          );
          remainder = remainder
            .components()
            .skip(1)
            .collect::<PathBuf>();
        }
      }
      for package_dir in
        resolver::package_dir_candidates(&base_dir, &package)
      {
        candidates.push(package_dir.join(&remainder));
      }
    }
  }

  let mut allowed_roots: Vec<PathBuf> = vec![config.root.clone()];
  allowed_roots.extend(config.resolver.node_modules_paths.iter().cloned());

  for candidate in candidates {
    let Ok(canonical) = std::fs::canonicalize(&candidate) else {
      continue;
    };
    let contained = allowed_roots.iter().any(|root| {
      std::fs::canonicalize(root)
        .map(|root| canonical.starts_with(root))
        .unwrap_or(false)
    });
    if !contained {
      return Err(anyhow!("path escapes the project root"));
    }
    if canonical.is_file() {
      return Ok(Some(canonical));
    }
  }
  Ok(None)
}

fn content_type_for(path: &Path) -> &'static str {
  match path.extension().and_then(|e| e.to_str()) {
    Some("png") => "image/png",
    Some("jpg") | Some("jpeg") => "image/jpeg",
    Some("gif") => "image/gif",
    Some("webp") => "image/webp",
    Some("svg") => "image/svg+xml",
    Some("bmp") => "image/bmp",
    Some("js") => "application/javascript",
    Some("json") | Some("map") => "application/json",
    Some("html") => "text/html; charset=utf-8",
    Some("ttf") => "font/ttf",
    Some("otf") => "font/otf",
    Some("mp3") => "audio/mpeg",
    Some("wav") => "audio/wav",
    Some("mp4") => "video/mp4",
    _ => "application/octet-stream",
  }
}

// ---------------------------------------------------------------------------
// Symbolication

async fn handle_symbolicate(
  inner: Arc<Inner>,
  req: Request<Incoming>,
) -> Result<HandlerResponse, AnyError> {
  if req.method() != Method::POST {
    return Ok(text_response(
      StatusCode::METHOD_NOT_ALLOWED,
      "method not allowed",
    ));
  }
  let bytes = req.into_body().collect().await?.to_bytes();
  let payload: Value = match serde_json::from_slice(&bytes) {
    Ok(payload) => payload,
    Err(_) => {
      return Ok(text_response(StatusCode::BAD_REQUEST, "invalid body"))
    }
  };
  let frames = payload["stack"].as_array().cloned().unwrap_or_default();

  let builds = inner.builds.lock().await;
  let mut out_frames = Vec::with_capacity(frames.len());
  let mut code_frame = Value::Null;

  for frame in frames {
    let file = frame["file"].as_str().unwrap_or("");
    // Frames without bundle info pass through unchanged.
    if file.contains("debuggerWorker.js") || !file.contains(".bundle") {
      out_frames.push(frame);
      continue;
    }
    let record = file
      .split('?')
      .next()
      .and_then(|url| url.rsplit('/').next())
      .and_then(|bundle_name| {
        let query = file.splitn(2, '?').nth(1).unwrap_or("");
        BundleParams::from_request(
          &format!("/{}", bundle_name),
          query,
          &inner.config,
        )
      })
      .and_then(|params| builds.get(&params.key()));
    let Some(record) = record else {
      out_frames.push(frame);
      continue;
    };

    let line = frame["lineNumber"].as_u64().unwrap_or(0) as usize;
    let column = frame["column"].as_u64().unwrap_or(0) as usize;
    match symbolicate_frame(&record.bundle, &record.state.graph, line, column)
    {
      Some((source, src_line, src_column)) => {
        if code_frame.is_null() {
          code_frame = build_code_frame(&source, src_line, src_column);
        }
        let mut updated = frame.clone();
        updated["file"] = json!(source);
        updated["lineNumber"] = json!(src_line);
        updated["column"] = json!(src_column);
        out_frames.push(updated);
      }
      None => out_frames.push(frame),
    }
  }

  Ok(response(
    StatusCode::OK,
    "application/json",
    json!({ "stack": out_frames, "codeFrame": code_frame }).to_string(),
  ))
}

/// Maps a 1-based bundle line back through the owning module's source map.
pub fn symbolicate_frame(
  bundle: &Bundle,
  graph: &Graph,
  line: usize,
  column: usize,
) -> Option<(String, u32, u32)> {
  if line == 0 {
    return None;
  }
  let line0 = line - 1;
  let offsets = bundle.module_line_offsets();
  let index = offsets
    .iter()
    .enumerate()
    .rev()
    .find(|(_, offset)| **offset <= line0)
    .map(|(i, _)| i)?;
  let path = bundle.module_paths.get(index)?;
  let module = graph.get(path)?;
  let map_text = module.source_map.as_ref()?;
  let map = sourcemap::SourceMap::from_slice(map_text.as_bytes()).ok()?;

  // Wrapped modules carry one header line before the factory body.
  let line_in_module = line0.checked_sub(offsets[index] + 1)?;
  let token = map.lookup_token(line_in_module as u32, column as u32)?;
  let source = token.get_source()?.to_string();
  Some((source, token.get_src_line() + 1, token.get_src_col()))
}

fn build_code_frame(source: &str, line: u32, column: u32) -> Value {
  let Ok(contents) = std::fs::read_to_string(source) else {
    return Value::Null;
  };
  let Some(text) = contents.lines().nth(line.saturating_sub(1) as usize)
  else {
    return Value::Null;
  };
  json!({
    "content": text,
    "location": { "row": line, "column": column },
    "fileName": source,
  })
}

// ---------------------------------------------------------------------------
// WebSockets

#[derive(Debug, Clone, Copy, PartialEq)]
enum WebSocketKind {
  Hmr,
  Message,
}

fn handle_websocket(
  inner: Arc<Inner>,
  req: &mut Request<Incoming>,
  query: String,
  kind: WebSocketKind,
) -> Result<HandlerResponse, AnyError> {
  let (response, upgrade_fut) = fastwebsockets::upgrade::upgrade(req)
    .map_err(|err| anyhow!("websocket upgrade failed: {}", err))?;
  tokio::spawn(async move {
    let result = match kind {
      WebSocketKind::Hmr => hmr_client_task(inner, upgrade_fut, query).await,
      WebSocketKind::Message => message_client_task(inner, upgrade_fut).await,
    };
    if let Err(err) = result {
      debug!("websocket connection closed: {:#}", err);
    }
  });
  Ok(response.map(|body| body.boxed_unsync()))
}

/// The initial HMR sequence for a freshly connected client: an empty
/// update carrying the current revision of the bundle it registered for.
async fn initial_update_messages(
  inner: &Inner,
  query: &str,
) -> Option<Vec<Value>> {
  let params = parse_query(query);
  let entry = params.get("bundleEntry")?;
  let platform = params
    .get("platform")
    .cloned()
    .unwrap_or_else(|| inner.config.platform.to_string());
  let bundle_params = BundleParams::from_request(
    &format!("/{}", entry.trim_start_matches('/')),
    &format!("platform={}", platform),
    &inner.config,
  )?;
  let builds = inner.builds.lock().await;
  let record = builds.get(&bundle_params.key())?;
  let delta = Delta::default();
  Some(vec![
    hmr::update_start_message(true),
    hmr::update_message(
      &delta,
      &record.state,
      &record.state,
      &inner.config.root,
      true,
    ),
    hmr::update_done_message(),
  ])
}

async fn hmr_client_task(
  inner: Arc<Inner>,
  upgrade_fut: UpgradeFut,
  query: String,
) -> Result<(), AnyError> {
  let ws = upgrade_fut.await?;
  let mut ws = FragmentCollector::new(ws);
  let (sender, mut outgoing) = mpsc::unbounded_channel::<String>();
  let client_id = inner.next_client_id.fetch_add(1, Ordering::SeqCst);
  inner
    .hmr_clients
    .lock()
    .insert(client_id, HmrClient { sender });
  debug!("hmr client {} connected", client_id);

  if let Some(initial) = initial_update_messages(&inner, &query).await {
    for message in initial {
      ws.write_frame(Frame::text(Payload::Owned(
        message.to_string().into_bytes(),
      )))
      .await?;
    }
  }

  let result: Result<(), AnyError> = async {
    loop {
      tokio::select! {
        queued = outgoing.recv() => {
          let Some(text) = queued else { break };
          ws.write_frame(Frame::text(Payload::Owned(text.into_bytes())))
            .await?;
        }
        frame = ws.read_frame() => {
          let frame = frame?;
          match frame.opcode {
            OpCode::Close => break,
            OpCode::Text => {
              let text = String::from_utf8_lossy(&frame.payload).into_owned();
              if let Some(reply) = handle_hmr_message(&inner, &text) {
                ws.write_frame(Frame::text(Payload::Owned(
                  reply.to_string().into_bytes(),
                )))
                .await?;
              }
            }
            _ => {}
          }
        }
      }
    }
    Ok(())
  }
  .await;

  inner.hmr_clients.lock().remove(&client_id);
  debug!("hmr client {} disconnected", client_id);
  result
}

/// Handles one client -> server HMR frame, returning an optional direct
/// reply. Malformed messages are logged and ignored; the connection stays
/// open.
fn handle_hmr_message(inner: &Inner, text: &str) -> Option<Value> {
  let message: Value = match serde_json::from_str(text) {
    Ok(message) => message,
    Err(_) => {
      warn!("ignoring malformed hmr message: {}", text);
      return None;
    }
  };
  match message["type"].as_str() {
    Some("register-entrypoints") => Some(hmr::bundle_registered_message()),
    Some("log") | Some("log-opt-in") => {
      if inner.config.server.forward_client_logs {
        if let Some(data) = message.get("data") {
          debug!("client log: {}", data);
        }
      }
      None
    }
    other => {
      warn!("ignoring unsupported hmr message type: {:?}", other);
      None
    }
  }
}

async fn message_client_task(
  inner: Arc<Inner>,
  upgrade_fut: UpgradeFut,
) -> Result<(), AnyError> {
  let ws = upgrade_fut.await?;
  let mut ws = FragmentCollector::new(ws);
  let (sender, mut outgoing) = mpsc::unbounded_channel::<String>();
  let client_id = inner.next_client_id.fetch_add(1, Ordering::SeqCst);
  inner.message_clients.lock().insert(client_id, sender);

  let result: Result<(), AnyError> = async {
    loop {
      tokio::select! {
        queued = outgoing.recv() => {
          let Some(text) = queued else { break };
          ws.write_frame(Frame::text(Payload::Owned(text.into_bytes())))
            .await?;
        }
        frame = ws.read_frame() => {
          let frame = frame?;
          match frame.opcode {
            OpCode::Close => break,
            OpCode::Text => {
              // The message socket is a relay: forward to every other
              // connected client.
              let text = String::from_utf8_lossy(&frame.payload).into_owned();
              if let Ok(message) = serde_json::from_str::<Value>(&text) {
                inner.broadcast_message(&message, Some(client_id));
              }
            }
            _ => {}
          }
        }
      }
    }
    Ok(())
  }
  .await;

  inner.message_clients.lock().remove(&client_id);
  result
}

// ---------------------------------------------------------------------------
// File watching and incremental rebuilds

fn spawn_watch_task(inner: Arc<Inner>) {
  tokio::spawn(async move {
    let (watcher, mut debounce) =
      match file_watcher::watch(&[inner.config.root.clone()]) {
        Ok(pair) => pair,
        Err(err) => {
          error!("failed to start file watcher: {:#}", err);
          return;
        }
      };
    let _watcher = watcher;
    let cache_dir = inner.config.cache_dir();

    while let Some(batch) = debounce.next().await {
      let changed: Vec<PathBuf> = batch
        .into_iter()
        .filter(|path| file_watcher::is_relevant(path, &cache_dir))
        .collect();
      if changed.is_empty() {
        continue;
      }
      info!(
        "{} File change detected! Rebuilding...",
        colors::intense_blue("Watcher")
      );
      rebuild_and_broadcast(&inner, &changed).await;
    }
  });
}

async fn rebuild_and_broadcast(inner: &Arc<Inner>, changed: &[PathBuf]) {
  let mut builds = inner.builds.lock().await;
  for record in builds.values_mut() {
    if !record.params.dev {
      continue;
    }
    let builder =
      GraphBuilder::new(record.config.clone(), inner.cache.clone());
    inner.broadcast_hmr(&hmr::update_start_message(false));
    match incremental_build(changed, &record.state, &builder).await {
      Ok(result) => {
        let message = hmr::update_message(
          &result.delta,
          &record.state,
          &result.state,
          &inner.config.root,
          false,
        );
        record.state = result.state;
        if let Err(err) = serialize_record(record) {
          warn!("failed to re-serialize bundle: {:#}", err);
        }
        inner.broadcast_hmr(&message);
        inner.broadcast_hmr(&hmr::update_done_message());
      }
      Err(err) => {
        let kind = if err.downcast_ref::<TransformError>().is_some() {
          "TransformError"
        } else if err.downcast_ref::<ResolutionError>().is_some() {
          "ResolutionError"
        } else {
          "InternalError"
        };
        error!("{} {:#}", colors::red_bold("error"), err);
        inner.broadcast_hmr(&hmr::error_message(
          kind,
          &format!("{:#}", err),
          None,
        ));
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::TempDir;

  fn config_at(root: &Path) -> BungaeConfig {
    let mut config = BungaeConfig::default();
    config.root = root.to_path_buf();
    config
  }

  #[test]
  fn test_bundle_params_parsing() {
    let config = BungaeConfig::default();
    let params = BundleParams::from_request(
      "/index.bundle",
      "platform=android&dev=false&minify=true&runModule=false",
      &config,
    )
    .unwrap();
    assert_eq!(params.name, "index");
    assert_eq!(params.platform, Platform::Android);
    assert!(!params.dev);
    assert!(params.minify);
    assert!(!params.run_module);

    let defaults =
      BundleParams::from_request("/main.bundle.js", "", &config).unwrap();
    assert_eq!(defaults.name, "main");
    assert_eq!(defaults.platform, config.platform);
    assert_eq!(defaults.dev, config.dev);
    assert!(defaults.run_module);

    assert!(BundleParams::from_request("/index.txt", "", &config).is_none());
    assert!(BundleParams::from_request(
      "/index.bundle",
      "platform=tvos",
      &config
    )
    .is_none());
  }

  #[test]
  fn test_bundle_params_key_distinguishes_builds() {
    let config = BungaeConfig::default();
    let ios =
      BundleParams::from_request("/index.bundle", "platform=ios", &config)
        .unwrap();
    let android =
      BundleParams::from_request("/index.bundle", "platform=android", &config)
        .unwrap();
    assert_ne!(ios.key(), android.key());
    // The map for a bundle shares the build.
    let map =
      BundleParams::from_request("/index.map", "platform=ios", &config)
        .unwrap();
    assert_eq!(ios.key(), map.key());
  }

  #[test]
  fn test_asset_path_traversal_is_rejected() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    fs::write(root.join("icon.png"), "png").unwrap();
    let config = config_at(root);

    // A normal asset resolves.
    let ok =
      resolve_asset_path(&config, "icon.png", AssetBase::ProjectRoot).unwrap();
    assert!(ok.is_some());

    // Escapes resolve to 403/404, never to a file outside the root.
    let escape = resolve_asset_path(
      &config,
      "../../../../etc/passwd",
      AssetBase::ProjectRoot,
    );
    match escape {
      Ok(found) => assert!(found.is_none()),
      Err(_) => {}
    }
  }

  #[test]
  fn test_serve_asset_traversal_response_is_not_200() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    fs::write(root.join("icon.png"), "png").unwrap();
    let config = config_at(root);
    let response = serve_asset(&config, "../../etc/passwd", AssetBase::ProjectRoot);
    assert_ne!(response.status(), StatusCode::OK);

    let missing = serve_asset(&config, "missing.png", AssetBase::ProjectRoot);
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let found = serve_asset(&config, "icon.png", AssetBase::ProjectRoot);
    assert_eq!(found.status(), StatusCode::OK);
    assert_eq!(
      found.headers().get("Cache-Control").unwrap(),
      ASSET_CACHE_CONTROL
    );
  }

  #[test]
  fn test_content_types() {
    assert_eq!(content_type_for(Path::new("a.png")), "image/png");
    assert_eq!(
      content_type_for(Path::new("a.js")),
      "application/javascript"
    );
    assert_eq!(content_type_for(Path::new("a.unknown")), "application/octet-stream");
  }

  #[test]
  fn test_symbolicate_frame_maps_through_module() {
    use crate::graph::{Module, ModuleType};
    use crate::module_id::ModuleId;
    use std::collections::BTreeSet;

    let mut graph = Graph::new(PathBuf::from("/proj/index.js"));
    let mut module = Module {
      path: PathBuf::from("/proj/index.js"),
      module_type: ModuleType::Module,
      original_specifiers: vec![],
      resolved_dependencies: vec![],
      inverse_dependencies: BTreeSet::new(),
      transformed_code: "console.log(1);".to_string(),
      source_map: None,
      content_hash: String::new(),
    };
    module.source_map = Some(
      json!({
        "version": 3,
        "sources": ["/proj/src/index.js"],
        "names": [],
        "mappings": "AAAA",
      })
      .to_string(),
    );
    graph.insert(module);

    let wrapped = serializer::wrap_module(
      "console.log(1);",
      &ModuleId::Number(0),
      &[],
      None,
    );
    let bundle = Bundle {
      pre: "// pre".to_string(),
      modules: vec![(ModuleId::Number(0), wrapped)],
      post: String::new(),
      module_paths: vec![PathBuf::from("/proj/index.js")],
    };

    // Bundle layout: line 1 = pre, line 2 = __d( header, line 3 = body.
    let (source, line, column) =
      symbolicate_frame(&bundle, &graph, 3, 0).unwrap();
    assert_eq!(source, "/proj/src/index.js");
    assert_eq!(line, 1);
    assert_eq!(column, 0);

    // A line before any module maps to nothing.
    assert!(symbolicate_frame(&bundle, &graph, 1, 0).is_none());
  }

  #[test]
  fn test_parse_query() {
    let params = parse_query("a=1&b=&c=x%20y");
    assert_eq!(params.get("a").unwrap(), "1");
    assert_eq!(params.get("b").unwrap(), "");
    assert!(params.contains_key("c"));
  }

  #[test]
  fn test_hmr_register_entrypoints_reply() {
    let config = BungaeConfig::default();
    let server = DevServer::new(config);
    let reply = handle_hmr_message(
      &server.inner,
      r#"{"type":"register-entrypoints","entryPoints":["http://localhost:8081/index.bundle"]}"#,
    );
    assert_eq!(reply, Some(json!({ "type": "bundle-registered" })));
    assert_eq!(handle_hmr_message(&server.inner, r#"{"type":"log"}"#), None);
    assert_eq!(handle_hmr_message(&server.inner, "not json"), None);
  }
}
