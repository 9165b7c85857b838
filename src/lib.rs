// Library exports for the appwarden supervisor

pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod logwatch;
pub mod process;
pub mod registry;
