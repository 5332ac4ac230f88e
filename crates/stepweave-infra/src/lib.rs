//! Infrastructure layer for Stepweave.
//!
//! Implements the ports defined in `stepweave-core`: a SQLite-backed
//! snapshot store for suspended runs, plus loaders for `stepweave.toml` and
//! flow definition files.

pub mod config;
pub mod flow_file;
pub mod sqlite;
