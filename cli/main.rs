// Copyright 2024-2026 the Bungae authors. MIT license.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use bungae::config;
use bungae::config::BungaeConfig;
use bungae::config::Platform;
use bungae::errors;
use bungae::errors::AnyError;
use bungae::flags;
use bungae::flags::BungaeSubcommand;
use bungae::flags::Flags;
use bungae::server::DevServer;
use bungae::tools;

fn init_logger(log_debug: bool) {
  let mut builder = env_logger::Builder::from_env(
    env_logger::Env::default().default_filter_or(if log_debug {
      "debug"
    } else {
      "info"
    }),
  );
  builder.format_target(false);
  builder.format_timestamp(None);
  builder.init();
}

fn resolve_root(project: Option<&PathBuf>) -> Result<PathBuf, AnyError> {
  let root = match project {
    Some(dir) => dir.clone(),
    None => std::env::current_dir()?,
  };
  Ok(bungae::fs_util::canonicalize_path(&root)?)
}

/// Loads the project config and layers the command-line overrides on top.
fn configure(
  flags: &Flags,
  project: Option<&PathBuf>,
  entry: Option<&String>,
  platform: Option<&String>,
  dev: Option<bool>,
  minify: Option<bool>,
) -> Result<BungaeConfig, AnyError> {
  let root = resolve_root(project)?;
  let mut config = config::load_config(&root, flags.config.as_deref())?;
  if let Some(entry) = entry {
    config.entry = entry.clone();
  }
  if let Some(platform) = platform {
    config.platform = Platform::from_str(platform)?;
  }
  if let Some(dev) = dev {
    config.dev = dev;
  }
  if let Some(minify) = minify {
    config.minify = minify;
  }
  Ok(config)
}

async fn run_subcommand(flags: Flags) -> Result<(), AnyError> {
  match &flags.subcommand {
    BungaeSubcommand::Build(build_flags) => {
      let config = configure(
        &flags,
        build_flags.project.as_ref(),
        build_flags.entry.as_ref(),
        build_flags.platform.as_ref(),
        build_flags.dev,
        build_flags.minify,
      )?;
      tools::build::build_command(Arc::new(config), build_flags.out.clone())
        .await
    }
    BungaeSubcommand::Serve(serve_flags) => {
      let mut config = configure(
        &flags,
        serve_flags.project.as_ref(),
        serve_flags.entry.as_ref(),
        serve_flags.platform.as_ref(),
        serve_flags.dev,
        serve_flags.minify,
      )?;
      if let Some(port) = serve_flags.port {
        config.server.port = port;
      }
      DevServer::new(config).run().await
    }
    BungaeSubcommand::Benchmark(bench_flags) => {
      let config = configure(
        &flags,
        bench_flags.project.as_ref(),
        bench_flags.entry.as_ref(),
        bench_flags.platform.as_ref(),
        None,
        None,
      )?;
      tools::bench::bench_command(Arc::new(config), bench_flags.iterations)
        .await
    }
  }
}

fn main() {
  let args: Vec<String> = std::env::args().collect();
  let flags = match flags::flags_from_vec(args) {
    Ok(flags) => flags,
    Err(err) => err.exit(),
  };
  init_logger(flags.log_debug);

  let runtime = match tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .build()
  {
    Ok(runtime) => runtime,
    Err(err) => {
      eprintln!("{}", errors::format_error(&err.into()));
      std::process::exit(errors::EXIT_BUILD);
    }
  };

  if let Err(err) = runtime.block_on(run_subcommand(flags)) {
    eprintln!("{}", errors::format_error(&err));
    std::process::exit(errors::exit_code(&err));
  }
}
