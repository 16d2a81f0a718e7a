// Copyright 2024-2026 the Bungae authors. MIT license.

pub fn bungae() -> &'static str {
  env!("CARGO_PKG_VERSION")
}
