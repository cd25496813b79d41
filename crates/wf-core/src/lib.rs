//! Core data model and collaborator interfaces for weft.
//!
//! This crate defines the task graph and execution record shapes shared by
//! every other crate, the TOML configuration, and the interfaces the engine
//! consumes from the outside world:
//! - Graph and execution record stores
//! - Credential lookup by service name
//! - Cross-run failure memory (error signatures and learned remediations)
//!
//! In-memory implementations are provided for tests and single-process use.

pub mod config;
pub mod error_memory;
pub mod store;
pub mod types;
