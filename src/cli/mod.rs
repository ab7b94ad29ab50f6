//! CLI command definitions and handlers

pub mod run;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Roundtable - a turn-taking scheduler for cooperating agents
///
/// By default, runs the scheduler loop against the configured roster.
/// Use the 'beats' subcommand for the deterministic tick-driven mode.
#[derive(Parser, Debug)]
#[command(name = "roundtable")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, global = true, env = "ROUNDTABLE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the scheduler loop (the default)
    Run(RunArgs),

    /// Run the beat executor demo over the configured slots
    Beats(BeatsArgs),

    /// Validate the configuration and exit
    Check,
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Initial prompt that opens the conversation
    #[arg(short, long, default_value = "Begin by introducing yourself.")]
    pub prompt: String,

    /// Stop after this many slices (overrides the config)
    #[arg(long)]
    pub max_turns: Option<u64>,

    /// Use scripted stand-ins instead of live endpoints
    #[arg(long)]
    pub simulate: bool,

    /// Write the transcript to this file on shutdown
    #[arg(long)]
    pub transcript_out: Option<PathBuf>,

    /// Read console commands from stdin while running
    #[arg(long)]
    pub interactive: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct BeatsArgs {
    /// How many beats to run before stopping
    #[arg(long, default_value = "10")]
    pub beats: i64,
}
