//! Core library for the labflow protocol engine.
//!
//! labflow runs laboratory protocols (trees of steps with pauses, jumps and
//! device setpoints) against a set of devices, arbitrating which protocol or
//! operator may drive each device output at any time. It is used by the
//! `labflow` command-line host and by transport layers embedding a [`host::Host`].
//!
//! - [`fiber`]: protocol parsing and execution
//! - [`devices`]: nodes, claims and the device tree
//! - [`runner`]: declarations resolved into device writes
//! - [`host`]: chips and the request surface

pub mod config;
pub mod devices;
pub mod error;
pub mod fiber;
pub mod host;
pub mod logging;
pub mod runner;
