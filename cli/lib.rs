// Copyright 2024-2026 the Bungae authors. MIT license.

pub mod ast;
pub mod checksum;
pub mod colors;
pub mod config;
pub mod disk_cache;
pub mod errors;
pub mod file_watcher;
pub mod flags;
pub mod fs_util;
pub mod graph;
pub mod hmr;
pub mod incremental;
pub mod media_type;
pub mod module_id;
pub mod resolver;
pub mod serializer;
pub mod server;
pub mod tools;
pub mod version;
