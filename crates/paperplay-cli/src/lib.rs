//! Command-line front end for the paperplay voice engine.
//!
//! Reads utterances from stdin, one per line, and speaks each one through a
//! [`SpeakController`](paperplay_voice::SpeakController). A line that starts
//! before the previous one finished playing interrupts it.
#![deny(unsafe_code)]
#![deny(unused_crate_dependencies)]

// Used by the binary only.
use anyhow as _;
use dotenvy as _;
use tokio as _;
use tracing_subscriber as _;

pub mod bootstrap;
pub mod input;
pub mod parser;
pub mod presentation;

pub use bootstrap::{engine_config, sink_factory};
pub use input::{Input, parse_line};
pub use parser::Cli;
pub use presentation::describe;
