//! # mixtrack
//!
//! Whitelisted Mixpanel tracking for web requests, with optional customer.io
//! mirroring.
//!
//! ## Architecture
//!
//! ```text
//! Request -> middleware -> Track (validate + shape) -> Consumer -> flush -> Mixpanel
//!                                                               \-> customer.io
//! ```
//!
//! ## Modules
//!
//! - [`vocabulary`]: Events, properties and the baseline vocabularies
//! - [`registry`]: Resolving configured vocabularies and consumers by name
//! - [`track`]: The per-request tracking engine
//! - [`consumer`]: Consumer trait and built-in consumers
//! - [`customerio`]: Secondary sink mirroring
//! - [`middleware`]: axum request lifecycle glue
//! - [`query`]: Read-only JQL queries
//! - [`config`]: TOML configuration

pub mod config;
pub mod consumer;
pub mod customerio;
pub mod middleware;
pub mod query;
pub mod registry;
pub mod track;
pub mod vocabulary;

#[cfg(test)]
mod test_support;

// Re-export commonly used types at crate root
pub use config::{ConfigError, TrackConfig};
pub use consumer::{Consumer, ConsumerKind, Endpoint, Message};
pub use registry::Registry;
pub use track::{Properties, Track, TrackError};
pub use vocabulary::{
    Event, EventProperties, Events, ProfileMetaProperties, ProfileProperties, Property,
    Vocabulary,
};

/// Reported to Mixpanel as `mp_lib`
pub const LIB_NAME: &str = "rust";

/// Reported to Mixpanel as `$lib_version`
pub const LIB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Token used whenever nothing is actually sent
pub const TESTING_TOKEN: &str = "testing";

/// Request headers with this prefix become global event properties
pub const MIXPANEL_HEADER_PREFIX: &str = "x-mixpanel-";
