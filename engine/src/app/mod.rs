//! Application lifecycle

pub mod options;
pub mod run;
