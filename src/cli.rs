use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Niffler: terminal AI assistant with NATS-backed multi-agent routing
#[derive(Parser, Debug, Clone)]
#[command(name = "niffler")]
#[command(version)]
#[command(about = "Terminal AI assistant with streaming LLM sessions and multi-agent routing", long_about = None)]
pub struct Cli {
    /// Run headless as this agent (definition loaded from the agent dir)
    #[arg(long)]
    pub agent: Option<String>,

    /// Model nickname override for this session
    #[arg(long)]
    pub model: Option<String>,

    /// NATS server URL. Overrides config.
    #[arg(long)]
    pub nats_url: Option<String>,

    /// Send a single prompt instead of starting the interactive loop
    #[arg(long)]
    pub prompt: Option<String>,

    /// With --prompt: block until the final response arrives, then print it
    #[arg(long, default_value_t = false)]
    pub wait: bool,

    /// Log level (debug, info, warn, error)
    #[arg(long = "loglevel", default_value = "info", value_parser = ["debug", "info", "warn", "error"])]
    pub loglevel: String,

    /// Log resolved LLM request bodies at debug
    #[arg(long, default_value_t = false)]
    pub dump: bool,

    /// Log raw SSE data lines at trace
    #[arg(long, default_value_t = false)]
    pub dumpsse: bool,

    /// Write logs to this file instead of the default log directory
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Write a starter config and agent definition
    Init,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["niffler"]);
        assert!(cli.agent.is_none());
        assert!(cli.prompt.is_none());
        assert!(!cli.wait);
        assert!(!cli.dump);
        assert_eq!(cli.loglevel, "info");
    }

    #[test]
    fn test_agent_mode_flags() {
        let cli = Cli::parse_from([
            "niffler",
            "--agent",
            "coder",
            "--nats-url",
            "nats://bus:4222",
            "--loglevel",
            "debug",
        ]);
        assert_eq!(cli.agent.as_deref(), Some("coder"));
        assert_eq!(cli.nats_url.as_deref(), Some("nats://bus:4222"));
        assert_eq!(cli.loglevel, "debug");
    }

    #[test]
    fn test_single_shot_flags() {
        let cli = Cli::parse_from(["niffler", "--prompt", "@coder fix it", "--wait"]);
        assert_eq!(cli.prompt.as_deref(), Some("@coder fix it"));
        assert!(cli.wait);
    }

    #[test]
    fn test_invalid_loglevel_rejected() {
        assert!(Cli::try_parse_from(["niffler", "--loglevel", "verbose"]).is_err());
    }

    #[test]
    fn test_init_subcommand() {
        let cli = Cli::parse_from(["niffler", "init"]);
        assert!(matches!(cli.command, Some(Command::Init)));
    }
}
