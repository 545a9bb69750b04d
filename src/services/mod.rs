/// Per-client game session driver.
pub mod controller;
/// Sources of the authenticated user's identifier.
pub mod identity;
/// Change-notification subscriptions with watchdog recovery.
pub mod multiplexer;
/// Session store connection supervisor with reconnect backoff.
pub mod storage_supervisor;
