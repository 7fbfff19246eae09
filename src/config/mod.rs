//! Configuration file schema and loading

mod schema;
mod store;

pub use schema::{AppConfig, AudioConfig, ConnectionConfig, ConnectionMode, VideoConfig};
pub use store::{config_path, load, parse, validate, CONFIG_ENV};
