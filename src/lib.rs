#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod agent;
pub mod agent_layer;
pub mod chat;
pub mod constants;
pub mod debugger;
pub mod engine;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod metrics;
pub mod pipeline;
pub mod processor;
pub mod router;
pub mod routing;
pub mod str_utils;
pub mod types;

pub use types::*;

pub use main_helper::{AppState, Cli, Command};
