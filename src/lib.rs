pub mod analytics;
pub mod app;
pub mod cli;
pub mod config;
pub mod cost;
pub mod error;
pub mod export;
pub mod filter;
pub mod model;
pub mod storage;
pub mod util;
