//! Shared types for the Duat generation scheduler.
//!
//! This crate has zero internal dependencies so that the backend client,
//! the scheduler and the worker binary can all agree on request shapes,
//! lifecycle states and configuration.

pub mod config;
pub mod error;
pub mod naming;
pub mod request;
pub mod status;
pub mod types;
