// Copyright 2024-2026 the Bungae authors. MIT license.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use log::info;

use crate::colors;
use crate::config::BungaeConfig;
use crate::disk_cache::TransformCache;
use crate::errors::AnyError;
use crate::graph;
use crate::graph::CancelFlag;
use crate::graph::GraphBuilder;
use crate::incremental::BuildState;
use crate::module_id::ModuleIdFactory;
use crate::serializer;
use crate::serializer::SerializerOptions;

/// The result of a one-shot build: the serialized bundle text and the
/// state it came from (the benchmark harness reuses the latter).
pub struct BuildOutput {
  pub text: String,
  pub state: BuildState,
}

/// Bundles the configured entry once. Used by `bungae build` and by the
/// benchmark harness.
pub async fn bundle_once(config: &Arc<BungaeConfig>) -> Result<BuildOutput, AnyError> {
  let cache = if config.cache.enabled {
    Some(Arc::new(TransformCache::new(
      config.cache_dir(),
      config.cache.max_age_secs,
    )))
  } else {
    None
  };
  let builder = GraphBuilder::new(config.clone(), cache);
  let entry = if config.entry.starts_with("./")
    || config.entry.starts_with("../")
    || PathBuf::from(&config.entry).is_absolute()
  {
    builder.resolver().resolve(&config.entry, &config.root)?
  } else {
    builder
      .resolver()
      .resolve(&format!("./{}", config.entry), &config.root)?
  };

  let built = builder.build(&entry, &CancelFlag::default()).await?;
  let mut id_factory = ModuleIdFactory::new();
  graph::assign_ids(&built, &mut id_factory);

  let mut options = SerializerOptions::from_config(config);
  options.source_map_url = None;
  let pre = serializer::get_prepended_modules(config, &options)?;
  let bundle =
    serializer::base_js_bundle(&built, &pre, &mut id_factory, &options);
  let text = bundle.to_bundle_string();

  Ok(BuildOutput {
    text,
    state: BuildState::new(built, id_factory),
  })
}

/// `bungae build`: serialize to disk (or stdout), minifying through the
/// external minifier when configured.
pub async fn build_command(
  config: Arc<BungaeConfig>,
  out: Option<PathBuf>,
) -> Result<(), AnyError> {
  let start = Instant::now();
  let output = bundle_once(&config).await?;
  let text = if config.minify {
    crate::server::minify_bundle(&config.minifier, output.text).await?
  } else {
    output.text
  };

  match out {
    Some(out_path) => {
      let out_path = if out_path.is_absolute() {
        out_path
      } else {
        config.root.join(out_path)
      };
      if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
          format!("failed to create {}", parent.display())
        })?;
      }
      std::fs::write(&out_path, &text)
        .with_context(|| format!("failed to write {}", out_path.display()))?;
      info!(
        "{} Wrote {} modules to {} in {}ms",
        colors::green("Bundle"),
        output.state.graph.len(),
        out_path.display(),
        start.elapsed().as_millis()
      );
    }
    None => {
      println!("{}", text);
    }
  }
  Ok(())
}
