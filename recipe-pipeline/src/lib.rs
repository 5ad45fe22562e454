//! recipe-pipeline library crate.
//!
//! Asynchronous recipe generation: a durable task queue, an orchestrator that
//! fans out one image task per recipe step, and a progressive result store.

pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod services;
pub mod utils;

pub use error::{Error, Result};
