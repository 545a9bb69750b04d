//! Library crate for rizzk-game-sync, exposing the session coordination layer
//! to the demo binary and integration tests.

/// Runtime configuration loading.
pub mod config;
/// Persistence layer: entities, stores and the repository.
pub mod dao;
/// Serializable requests and summaries.
pub mod dto;
/// Service-level error type.
pub mod error;
/// Controller, multiplexer, identity and store supervision.
pub mod services;
/// Shared context, phase machines and domain state.
pub mod state;
