use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::bpf::filter::BPF_MAXINSNS;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/nhrpd/nhrpd.json";

#[derive(Parser, Debug)]
#[command(
    name = "nhrpd",
    version,
    about = "NHRP daemon core: outgoing traffic interception and multicast replication"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the capture dispatcher (default when no subcommand given)
    Run(RunArgs),
    /// Print the capture filter for the configured topology and exit
    ShowFilter(ShowFilterArgs),
}

/// Arguments shared by all modes.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Configuration file
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Override the filter instruction budget from the configuration
    #[arg(long, value_parser = validate_max_insns)]
    pub max_filter_insns: Option<usize>,
}

impl Default for ConfigArgs {
    fn default() -> Self {
        Self {
            config: PathBuf::from(DEFAULT_CONFIG_PATH),
            max_filter_insns: None,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ShowFilterArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Output format
    #[arg(long, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Run,
    ShowFilter,
}

fn validate_max_insns(s: &str) -> Result<usize, String> {
    let val: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid integer"))?;
    if val == 0 {
        Err("max-filter-insns must be at least 1".to_string())
    } else if val > BPF_MAXINSNS {
        Err(format!("max-filter-insns must be at most {BPF_MAXINSNS}"))
    } else {
        Ok(val)
    }
}

/// Flattened CLI configuration after resolving subcommand variants.
pub struct ResolvedCli {
    pub mode: Mode,
    pub config: PathBuf,
    pub max_filter_insns: Option<usize>,
    pub format: OutputFormat,
}

impl Cli {
    /// Resolve subcommand variants into a flat configuration struct.
    pub fn resolve(self) -> ResolvedCli {
        let (mode, args, format) = match self.command {
            Some(Command::Run(r)) => (Mode::Run, r.config, OutputFormat::Text),
            Some(Command::ShowFilter(s)) => (Mode::ShowFilter, s.config, s.format),
            None => (Mode::Run, ConfigArgs::default(), OutputFormat::Text),
        };
        ResolvedCli {
            mode,
            config: args.config,
            max_filter_insns: args.max_filter_insns,
            format,
        }
    }
}
