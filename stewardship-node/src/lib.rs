//! Stewardship Node - HTTP service for the graduated stewardship engine
//!
//! Wraps a `StewardshipEngine` over an on-disk policy store and serves it over
//! HTTP. The relationship graph is held in memory and fed through
//! `POST /relationships`; the periodic sweep runs in the background.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/stewardship-node/
//! ├── policies.sled/   # Policy store, appeals, audit log, offline cache
//! └── config.toml      # Configuration
//! ```

pub mod config;
pub mod error;
pub mod http;

pub use config::NodeConfig;
pub use error::NodeError;
pub use http::HttpServer;
