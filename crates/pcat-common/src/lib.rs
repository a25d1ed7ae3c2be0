//! Shared types for the pcat gateway manager.
//!
//! This crate contains:
//! - **Configuration**: modem GPIO wiring, dial credentials, watchdog and power timing
//! - **Status models**: access technology, device class and the status snapshot

pub mod config;
pub mod models;
