use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "nexus",
    version,
    about = "Local controller for developer services"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Use a specific config file
    #[arg(short = 'f', long = "file", global = true)]
    pub config_file: Option<PathBuf>,

    /// Directory holding the registry and logs (overrides the config)
    #[arg(long, global = true, env = "NEXUS_DATA_DIR")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the controller: auto-start services and serve the HTTP API
    Serve {
        /// Address to bind the API on
        #[arg(long, env = "NEXUS_HOST")]
        host: Option<String>,
        /// Port to bind the API on
        #[arg(long, env = "NEXUS_PORT")]
        port: Option<u16>,
        /// Do not start registered services on boot
        #[arg(long)]
        no_auto_start: bool,
        /// Stop every running service when the controller shuts down
        #[arg(long)]
        stop_on_exit: bool,
    },
    /// Show registered services and whether their processes are alive
    Ps {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show the captured output of a service
    Logs {
        /// Service id, id prefix or name
        service: String,
        /// Number of lines to show
        #[arg(short = 'n', long = "lines", default_value_t = 200)]
        lines: usize,
        /// Minimum log level to show (trace, debug, info, warn, error)
        #[arg(long)]
        level: Option<String>,
        /// Only show lines matching this regex
        #[arg(long)]
        grep: Option<String>,
        /// Prefix each line with its capture time
        #[arg(long, short = 't')]
        timestamps: bool,
        /// Print one JSON object per line
        #[arg(long)]
        json: bool,
    },
    /// Add a service to the registry
    Register(RegisterArgs),
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Debug, Args)]
pub struct RegisterArgs {
    /// Display name
    #[arg(long)]
    pub name: String,
    /// Shell command that starts the service; may use {PORT} and {HOST}
    #[arg(long = "command", short = 'c', default_value = "")]
    pub command: String,
    /// Working directory (defaults to the controller's)
    #[arg(long)]
    pub cwd: Option<PathBuf>,
    /// Preferred port
    #[arg(long)]
    pub port: Option<u16>,
    /// Category, used to pick a port band
    #[arg(long)]
    pub category: Option<String>,
    /// Command run before the process tree is signalled
    #[arg(long)]
    pub stop_command: Option<String>,
    /// URL probed by the health endpoint
    #[arg(long)]
    pub healthcheck_url: Option<String>,
    /// URL where the service is reachable
    #[arg(long)]
    pub url: Option<String>,
    /// Environment override, KEY=VALUE (repeatable)
    #[arg(long = "env", short = 'e', value_parser = parse_key_val)]
    pub env: Vec<(String, String)>,
    /// Tag (repeatable)
    #[arg(long = "tag")]
    pub tags: Vec<String>,
    /// Id or name of a service this one talks to (repeatable)
    #[arg(long = "depends-on")]
    pub dependencies: Vec<String>,
    #[arg(long, default_value = "")]
    pub description: String,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}
