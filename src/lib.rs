// ABOUTME: Root library module exposing the bridge's public modules
// ABOUTME: Portal pipeline, stores, intents, and the update dispatchers

pub mod dispatch;
pub mod intent;
pub mod matrix;
pub mod portal;
pub mod power_levels;
pub mod puppet;
pub mod store;
pub mod telegram;

// Re-export the shared core types so binaries and tests reach everything
// through one crate.
pub use telebridge_core::config;
pub use telebridge_core::dedup;
pub use telebridge_core::ids;
pub use telebridge_core::media;
pub use telebridge_core::render;
