//! Dispatch core for a personal automation agent: routes each unit of work
//! to an executor, falls back along a chain, tracks spend, and alerts loudly
//! when every path is exhausted.

pub mod cli;
pub mod core;
pub mod interfaces;
pub mod logging;
pub mod platform;
