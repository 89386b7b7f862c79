//! Configuration for applications embedding `airimage-core`.
//!
//! Loads an [`AirImageConfig`] from a file or the environment, installs the
//! tracing subscriber, and turns the configuration into a ready
//! [`ImageCache`](airimage_core::ImageCache) backed by the HTTP transport.

pub mod loader;
pub mod logging;
pub mod models;
pub mod wiring;

pub use logging::init_tracing;
pub use models::{AirImageConfig, ConfigSource};
pub use wiring::build_cache;
