//! CLI argument parsing using clap 4.x derive macros

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use nodetool_core::Value;

/// Run NodeTool workflows from the terminal
///
/// Connects to a NodeTool worker socket, streams progress and outputs of a
/// workflow execution, and prints the merged result.
#[derive(Parser, Debug)]
#[command(name = "nodetool")]
#[command(author, about, long_about = None)]
#[command(disable_version_flag = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config file (defaults to ./nodetool.toml, then ~/.config/nodetool/nodetool.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print version information
    #[arg(long)]
    pub version: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a workflow and stream its events
    Run {
        /// Workflow id (or name with --name)
        workflow: String,

        /// Treat WORKFLOW as a workflow name
        #[arg(long)]
        name: bool,

        /// Input as key=value; values parse as JSON when possible
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,

        /// Give up waiting after this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Fetch asset outputs (maps with a uri) into this directory
        #[arg(short, long)]
        download_dir: Option<PathBuf>,
    },

    /// Print the input signature used for on-change reruns
    Signature {
        /// Input as key=value; values parse as JSON when possible
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,

        /// Keys left out of the signature
        #[arg(short, long)]
        exclude: Vec<String>,
    },

    /// List workflows known to the server
    Workflows,
}

/// Parse `key=value` pairs into workflow inputs
pub fn parse_inputs(raw: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut inputs = BTreeMap::new();
    for pair in raw {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("input '{}' is not in key=value form", pair);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("input '{}' has an empty key", pair);
        }
        inputs.insert(key.to_string(), parse_input_value(value));
    }
    Ok(inputs)
}

fn parse_input_value(raw: &str) -> Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(json) => Value::from_json(json),
        Err(_) => Value::from(raw),
    }
}
