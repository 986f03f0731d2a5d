//! Utility types and functions

pub mod bit;
pub mod config;
pub mod logger;
