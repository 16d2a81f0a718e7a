// Copyright 2024-2026 the Bungae authors. MIT license.

pub mod bench;
pub mod build;
