//! Core types and utilities for the FX rate streamer
//!
//! This crate provides shared types used across all components:
//! - Quote, baseline and active-rate records
//! - Update events and percentage-change math
//! - Feed wire format
//! - Settings and error types

pub mod types;
pub mod quotes;
pub mod config;
pub mod errors;

pub use types::*;
pub use quotes::*;
pub use config::*;
pub use errors::*;
