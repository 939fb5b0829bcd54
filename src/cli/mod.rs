//! CLI module for patchrun - command-line interface and subcommands.

pub mod commands;

pub use commands::Cli;
