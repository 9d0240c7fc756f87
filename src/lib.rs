pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod exec;
pub mod indexer;
pub mod logging;
pub mod model;
pub mod retrieve;
pub mod service;
pub mod store;
pub mod util;

pub use config::Config;
pub use service::{Engine, IngestOverrides};
