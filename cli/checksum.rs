// Copyright 2024-2026 the Bungae authors. MIT license.

use blake2::Blake2b512;
use blake2::Digest;

/// Hex digest over the concatenation of the given byte slices.
pub fn gen(v: &[impl AsRef<[u8]>]) -> String {
  let mut hasher = Blake2b512::new();
  for src in v {
    hasher.update(src.as_ref());
  }
  let digest = hasher.finalize();
  let out: Vec<String> = digest
    .iter()
    .map(|byte| format!("{:02x}", byte))
    .collect();
  out.join("")
}
