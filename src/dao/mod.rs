/// Database model definitions.
pub mod models;
/// Typed session, player and action operations.
pub mod repository;
/// Session store abstraction and its backends.
pub mod session_store;
/// Storage error model shared by every backend.
pub mod storage;
