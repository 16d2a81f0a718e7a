// Copyright 2024-2026 the Bungae authors. MIT license.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

use crate::colors;

pub type AnyError = anyhow::Error;

/// Process exit code for a configuration problem; every other build failure
/// exits with `1`.
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_BUILD: i32 = 1;

/// A specifier could not be mapped to a file on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionError {
  pub specifier: String,
  pub referrer: PathBuf,
  pub attempts: Vec<PathBuf>,
}

impl fmt::Display for ResolutionError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(
      f,
      "Unable to resolve module \"{}\" from \"{}\"",
      self.specifier,
      self.referrer.display()
    )?;
    if !self.attempts.is_empty() {
      write!(f, "\n  Tried:")?;
      for attempt in &self.attempts {
        write!(f, "\n    {}", attempt.display())?;
      }
    }
    Ok(())
  }
}

impl Error for ResolutionError {}

/// A parse or lowering failure for a single file.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformError {
  pub path: PathBuf,
  pub diagnostic: String,
}

impl fmt::Display for TransformError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{}: {}", self.path.display(), self.diagnostic)
  }
}

impl Error for TransformError {}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ConfigError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  #[error("cache read failed: {0}")]
  Read(std::io::Error),
  #[error("cache write failed: {0}")]
  Write(std::io::Error),
}

/// A malformed message from an HMR client. Logged and ignored; the
/// connection stays open.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unsupported message: {0}")]
pub struct ProtocolError(pub String);

/// Maps an error chain to the process exit code of the CLI contract.
pub fn exit_code(err: &AnyError) -> i32 {
  if err.downcast_ref::<ConfigError>().is_some() {
    EXIT_CONFIG
  } else {
    EXIT_BUILD
  }
}

/// Single formatted diagnostic for fatal errors.
pub fn format_error(err: &AnyError) -> String {
  format!("{}: {:#}", colors::red_bold("error"), err)
}
