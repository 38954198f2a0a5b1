//! Configuration module for modelkeeper
//!
//! Loads config from `$XDG_CONFIG_HOME/modelkeeper/config.toml` or `~/.config/modelkeeper/config.toml`.
//! Falls back to embedded defaults if file doesn't exist.
//! Partial configs are merged with defaults using serde's default attributes.
//! `MODELKEEPER_MODELS_DIR` and `MODELKEEPER_APP_VERSION` override the file.
//!
//! # Example
//!
//! ```no_run
//! use modelkeeper::config::Config;
//!
//! let config = Config::load().expect("Failed to load config");
//! println!("Models dir: {}", config.models_dir().unwrap().display());
//! println!("Host version: {}", config.app.version);
//! ```

pub mod schema;

pub use schema::Config;
