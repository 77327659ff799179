use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dispatchd")]
#[command(about = "Ride dispatch - matches ride requests to nearby drivers")]
#[command(version = "0.1.0")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the dispatch service
    Start {
        /// Which parts of the service this process runs
        #[arg(short, long, value_enum, default_value = "all")]
        role: Role,

        /// Path to the configuration file
        #[arg(short, long, default_value = "dispatch_config/dispatch.yaml", env = "DISPATCH_CONFIG")]
        config: PathBuf,

        /// Override the API port
        #[arg(long)]
        http: Option<u16>,

        /// Override the Prometheus exporter port
        #[arg(long)]
        metrics: Option<u16>,

        /// Override the log format (pretty, json, compact)
        #[arg(long)]
        log_format: Option<String>,

        /// Instance identity used as batch-lock owner
        #[arg(long, env = "DISPATCH_INSTANCE_ID")]
        instance_id: Option<String>,
    },

    /// Validate configuration without starting the service
    Validate {
        /// Path to the configuration file
        #[arg(short, long, default_value = "dispatch_config/dispatch.yaml")]
        config: PathBuf,
    },

    /// Write a configuration file with all defaults
    Init {
        /// Output path for the new configuration file
        #[arg(short, long, default_value = "dispatch.yaml")]
        output: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// HTTP API and background workers in one process
    All,

    /// HTTP API only; workers run elsewhere
    Api,

    /// Background workers only (matching batches, sweeps, surge refresh)
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::All => "all",
            Role::Api => "api",
            Role::Worker => "worker",
        }
    }

    pub fn runs_api(&self) -> bool {
        matches!(self, Role::All | Role::Api)
    }

    pub fn runs_workers(&self) -> bool {
        matches!(self, Role::All | Role::Worker)
    }
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
    fn test_start_defaults() {
        let cli = Cli::try_parse_from(["dispatchd", "start"]).unwrap();
        match cli.command {
            Commands::Start { role, http, .. } => {
                assert_eq!(role, Role::All);
                assert!(http.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_worker_role() {
        let cli = Cli::try_parse_from(["dispatchd", "start", "--role", "worker", "--http", "9000"])
            .unwrap();
        match cli.command {
            Commands::Start { role, http, .. } => {
                assert!(role.runs_workers());
                assert!(!role.runs_api());
                assert_eq!(http, Some(9000));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_init_output() {
        let cli = Cli::try_parse_from(["dispatchd", "init", "-o", "/tmp/x.yaml"]).unwrap();
        assert!(matches!(cli.command, Commands::Init { ref output } if output.ends_with("x.yaml")));
    }
}
