//! Everything that talks to the valve controller.
//!
//! - [`adapter`]: byte-level serial links
//! - [`command`]: wire frames
//! - [`controller`]: handshake, pin cache and reconnect logic
//! - [`pump`]: three-valve pumps and their run limits
//! - [`mock`]: in-memory device for tests and dry runs

pub mod adapter;
pub mod command;
pub mod controller;
pub mod mock;
pub mod pump;
