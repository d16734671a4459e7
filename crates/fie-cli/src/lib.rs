//! # fie-cli
//!
//! Control surface of the fog infrastructure emulator.
//!
//! `fie up` builds the declared topology on the local host and serves a
//! line-oriented operator shell over it:
//!
//! ```text
//! ┌───────────┐   ps / run / migrate / scale / routeall   ┌──────────────┐
//! │  operator │──────────────────────────────────────────►│ Orchestrator │
//! └───────────┘        (stdin, one command per line)      └──────────────┘
//! ```
//!
//! [`control::ControlSurface`] turns each line into an orchestrator call
//! and renders the result, including failures, as a reply.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod commands;
pub mod control;
pub mod error;
pub mod output;

pub use cli::{Cli, Commands, Format, LogFormat, UpArgs};
pub use control::{ControlCommand, ControlSurface, Outcome};
pub use error::CliError;
pub use output::OutputFormat;
