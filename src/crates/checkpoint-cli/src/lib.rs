//! # checkpoint-cli
//!
//! Operator tooling for checkpoint stores: schema migrations, thread and chain
//! inspection, pending-write listings, crash recovery and thread deletion.
//! The `ckpt` binary parses arguments; the handlers here produce its JSON output.

pub mod commands;
pub mod settings;
