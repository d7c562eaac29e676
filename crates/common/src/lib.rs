//! Common utilities and types shared across the signaling crates.

#![warn(clippy::pedantic)]

/// Module for identifier types (rooms, participants, feeds)
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;
