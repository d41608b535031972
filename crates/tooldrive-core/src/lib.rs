//! Core types, config, errors, and shared runtime services for tooldrive.

pub mod config;
pub mod confirm;
pub mod context;
pub mod error;
pub mod message;
pub mod output;
pub mod status;
pub mod transcript;
