//! Core library for the KATARA valve and pump controller.
//!
//! Operators compose protocols out of valve, pump and pause steps, optionally
//! nested in loops whose parameters depend on the current iteration. This
//! crate validates those protocols, runs them against the controller over a
//! serial link and keeps the controller's pin state in sync when the link
//! drops. It is used by the `katara` command line tool.

pub mod config;
pub mod error;
pub mod expression;
pub mod hardware;
pub mod observer;
pub mod protocol;
pub mod session;
