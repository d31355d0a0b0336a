//! Multi-row chance roller with pluggable row-selection strategies.
//!
//! A [`sim::Simulation`] holds rows of pending slots and a shared success
//! chance that moves after every roll. A [`strategy::Strategy`] decides which
//! row to roll next; [`runner::run`] drives it to completion, pacing each step
//! through a [`pacing::PacingController`]. [`session::Session`] bundles the
//! pieces for interactive use and [`bench`] runs strategies headless.

pub mod bench;
pub mod builtin;
pub mod config;
pub mod error;
pub mod logging;
pub mod pacing;
pub mod registry;
pub mod runner;
pub mod script;
pub mod session;
pub mod sim;
pub mod strategy;

pub use error::{Result, SimError};
