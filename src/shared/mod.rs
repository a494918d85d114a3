pub mod config;
pub mod entities;
pub mod error;
pub mod logging;
pub mod media;
pub mod ports;

pub use config::Config;
