// Copyright 2024-2026 the Bungae authors. MIT license.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use log::warn;

use crate::colors;
use crate::config::BungaeConfig;
use crate::disk_cache::TransformCache;
use crate::errors::AnyError;
use crate::tools::build::bundle_once;

/// `bungae benchmark`: one cold build (cache cleared), then N warm builds,
/// reporting wall-clock timings.
pub async fn bench_command(
  config: Arc<BungaeConfig>,
  iterations: u32,
) -> Result<(), AnyError> {
  let cache = TransformCache::new(config.cache_dir(), config.cache.max_age_secs);
  if let Err(err) = cache.clear() {
    warn!("failed to clear transform cache: {}", err);
  }

  let cold_start = Instant::now();
  let output = bundle_once(&config).await?;
  let cold = cold_start.elapsed();
  println!(
    "{}  {} modules, {} bytes",
    colors::bold("cold build"),
    output.state.graph.len(),
    output.text.len()
  );
  println!("  {}", format_duration(cold));

  let mut warm: Vec<Duration> = Vec::with_capacity(iterations as usize);
  for _ in 0..iterations {
    let start = Instant::now();
    bundle_once(&config).await?;
    warm.push(start.elapsed());
  }

  if !warm.is_empty() {
    let min = warm.iter().min().copied().unwrap_or_default();
    let total: Duration = warm.iter().sum();
    let mean = total / warm.len() as u32;
    println!(
      "{}  {} iterations",
      colors::bold("warm builds"),
      warm.len()
    );
    println!(
      "  min {}  mean {}",
      format_duration(min),
      format_duration(mean)
    );
  }

  let stats = cache.stats();
  println!(
    "{}  {} entries, {} bytes",
    colors::bold("cache"),
    stats.entries,
    stats.total_bytes
  );
  Ok(())
}

fn format_duration(duration: Duration) -> String {
  format!("{:.1}ms", duration.as_secs_f64() * 1000.0)
}
