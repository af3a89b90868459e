//! Connectors & pipeline control for Hadron Connect.

pub mod app;
pub mod config;
#[cfg(test)]
mod config_test;
pub mod connector;
pub mod database;
pub mod engine;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod format;
pub mod models;
pub mod pipeline;
pub mod registry;
#[cfg(test)]
mod registry_test;
pub mod server;
pub mod utils;
