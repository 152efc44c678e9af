//! Data models

pub mod deployment;
pub mod message;
pub mod template;
