//! Berth Deployment Engine Library
//!
//! Core modules for the Berth platform's deployment execution engine.

pub mod app;
pub mod errors;
pub mod exec;
pub mod logs;
pub mod models;
pub mod platform;
pub mod provision;
pub mod server;
pub mod storage;
pub mod utils;
