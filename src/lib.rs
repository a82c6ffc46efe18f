// Error taxonomy shared across the engine
pub mod error;

// Engine settings
pub mod config;

// Encrypted credential vault
pub mod vault;

// OAuth2 authorization lifecycle
pub mod auth;

// Local sync-state bookkeeping
pub mod tracker;

// Bounded-retry remote transport
pub mod transport;

// Google Drive storage adapter
pub mod remote;

// Push/pull orchestration
pub mod sync;
