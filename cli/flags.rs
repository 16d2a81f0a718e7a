// Copyright 2024-2026 the Bungae authors. MIT license.

use std::path::PathBuf;

use clap::Arg;
use clap::ArgAction;
use clap::ArgMatches;
use clap::ColorChoice;
use clap::Command;

#[derive(Clone, Debug, PartialEq, Default)]
pub struct BuildFlags {
  pub entry: Option<String>,
  pub platform: Option<String>,
  pub dev: Option<bool>,
  pub minify: Option<bool>,
  pub project: Option<PathBuf>,
  pub out: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct ServeFlags {
  pub entry: Option<String>,
  pub platform: Option<String>,
  pub dev: Option<bool>,
  pub minify: Option<bool>,
  pub project: Option<PathBuf>,
  pub port: Option<u16>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BenchmarkFlags {
  pub entry: Option<String>,
  pub platform: Option<String>,
  pub project: Option<PathBuf>,
  pub iterations: u32,
}

impl Default for BenchmarkFlags {
  fn default() -> Self {
    Self {
      entry: None,
      platform: None,
      project: None,
      iterations: 5,
    }
  }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BungaeSubcommand {
  Build(BuildFlags),
  Serve(ServeFlags),
  Benchmark(BenchmarkFlags),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Flags {
  pub subcommand: BungaeSubcommand,
  pub config: Option<PathBuf>,
  pub log_debug: bool,
}

fn bundle_args(command: Command) -> Command {
  command
    .arg(
      Arg::new("entry")
        .long("entry")
        .value_name("PATH")
        .help("Entry module, relative to the project root"),
    )
    .arg(
      Arg::new("platform")
        .long("platform")
        .value_parser(["ios", "android", "web", "native"])
        .help("Target platform"),
    )
    .arg(
      Arg::new("dev")
        .long("dev")
        .value_parser(clap::value_parser!(bool))
        .help("Development build (sets __DEV__, enables HMR support)"),
    )
    .arg(
      Arg::new("minify")
        .long("minify")
        .value_parser(clap::value_parser!(bool))
        .help("Run the external minifier over the bundle"),
    )
    .arg(
      Arg::new("project")
        .long("project")
        .value_name("DIR")
        .value_parser(clap::value_parser!(PathBuf))
        .help("Project root directory"),
    )
}

fn build_subcommand() -> Command {
  bundle_args(Command::new("build"))
    .about("Bundle an entry module and write it to disk")
    .arg(
      Arg::new("out")
        .long("out")
        .value_name("FILE")
        .value_parser(clap::value_parser!(PathBuf))
        .help("Output bundle file"),
    )
}

fn serve_subcommand() -> Command {
  bundle_args(Command::new("serve"))
    .about("Start the development server")
    .arg(
      Arg::new("port")
        .long("port")
        .value_parser(clap::value_parser!(u16))
        .help("Port to listen on"),
    )
}

fn benchmark_subcommand() -> Command {
  Command::new("benchmark")
    .about("Measure cold and warm build times")
    .arg(Arg::new("entry").long("entry").value_name("PATH"))
    .arg(
      Arg::new("platform")
        .long("platform")
        .value_parser(["ios", "android", "web", "native"]),
    )
    .arg(
      Arg::new("project")
        .long("project")
        .value_name("DIR")
        .value_parser(clap::value_parser!(PathBuf)),
    )
    .arg(
      Arg::new("iterations")
        .long("iterations")
        .value_parser(clap::value_parser!(u32))
        .help("Number of warm builds to run"),
    )
}

fn bungae_command() -> Command {
  Command::new("bungae")
    .bin_name("bungae")
    .color(ColorChoice::Never)
    .version(crate::version::bungae())
    .about("Metro-compatible JavaScript bundler for React Native")
    .subcommand_required(true)
    .arg_required_else_help(true)
    .arg(
      Arg::new("config")
        .short('c')
        .long("config")
        .global(true)
        .value_name("FILE")
        .value_parser(clap::value_parser!(PathBuf))
        .help("Path to bungae.config.json (overrides discovery)"),
    )
    .arg(
      Arg::new("log-debug")
        .short('D')
        .long("log-debug")
        .global(true)
        .action(ArgAction::SetTrue)
        .help("Log debug output"),
    )
    .subcommand(build_subcommand())
    .subcommand(serve_subcommand())
    .subcommand(benchmark_subcommand())
}

fn bundle_parse(matches: &ArgMatches) -> BuildFlags {
  BuildFlags {
    entry: matches.get_one::<String>("entry").cloned(),
    platform: matches.get_one::<String>("platform").cloned(),
    dev: matches.get_one::<bool>("dev").copied(),
    minify: matches.get_one::<bool>("minify").copied(),
    project: matches.get_one::<PathBuf>("project").cloned(),
    out: None,
  }
}

pub fn flags_from_vec(args: Vec<String>) -> clap::error::Result<Flags> {
  let matches = bungae_command().try_get_matches_from(args)?;
  let config = matches.get_one::<PathBuf>("config").cloned();
  let log_debug = matches.get_flag("log-debug");

  let subcommand = match matches.subcommand() {
    Some(("build", m)) => {
      let mut flags = bundle_parse(m);
      flags.out = m.get_one::<PathBuf>("out").cloned();
      BungaeSubcommand::Build(flags)
    }
    Some(("serve", m)) => {
      let build = bundle_parse(m);
      BungaeSubcommand::Serve(ServeFlags {
        entry: build.entry,
        platform: build.platform,
        dev: build.dev,
        minify: build.minify,
        project: build.project,
        port: m.get_one::<u16>("port").copied(),
      })
    }
    Some(("benchmark", m)) => BungaeSubcommand::Benchmark(BenchmarkFlags {
      entry: m.get_one::<String>("entry").cloned(),
      platform: m.get_one::<String>("platform").cloned(),
      project: m.get_one::<PathBuf>("project").cloned(),
      iterations: m.get_one::<u32>("iterations").copied().unwrap_or(5),
    }),
    _ => unreachable!(),
  };

  Ok(Flags {
    subcommand,
    config,
    log_debug,
  })
}
