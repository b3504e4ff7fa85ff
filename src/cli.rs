//! CLI argument parsing for peekaboo

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{BufferCapacities, TraceConfig};
use crate::error::Result;

#[derive(Parser, Debug)]
#[command(name = "peekaboo")]
#[command(version)]
#[command(about = "Instruction-level execution trace recorder", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Record a synthetic instruction stream into a new trace root
    Synth(SynthArgs),

    /// Summarize a recorded trace root
    Inspect {
        /// Trace root directory (`<binary>-<pid>`)
        root: PathBuf,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,

        /// Also list the raw-byte map (pc, length, hex encoding)
        #[arg(long = "byte-map", conflicts_with = "json")]
        byte_map: bool,
    },

    /// Check a recorded trace root for partial or uncorrelated records
    Verify {
        /// Trace root directory (`<binary>-<pid>`)
        root: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
pub struct SynthArgs {
    /// Instructions executed per thread
    #[arg(short = 'n', long, default_value_t = 10_000)]
    pub count: u64,

    /// Instruction N carries N % (MEM_OPS + 1) memory operands
    #[arg(short = 'm', long = "mem-ops", default_value_t = 0)]
    pub mem_ops: usize,

    /// Number of traced threads
    #[arg(short = 't', long, default_value_t = 1)]
    pub threads: usize,

    /// TOML configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory in which the trace root is created
    #[arg(short = 'o', long = "output-dir", value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Records per buffer for every stream
    #[arg(long, value_name = "RECORDS")]
    pub capacity: Option<usize>,

    /// Capture SIMD registers in each register snapshot
    #[arg(long)]
    pub simd: bool,

    /// Capture the FXSAVE area in each register snapshot
    #[arg(long)]
    pub fxsave: bool,

    /// Binary name used for the trace root
    #[arg(long, default_value = "synthetic")]
    pub name: String,

    /// Fork after N instructions; parent and child each finish the stream
    #[arg(long = "fork-at", value_name = "N", conflicts_with = "crash_after")]
    pub fork_at: Option<u64>,

    /// Deliver SIGSEGV to the tracer after N instructions and exit
    #[arg(long = "crash-after", value_name = "N")]
    pub crash_after: Option<u64>,
}

impl SynthArgs {
    /// Configuration file values with command-line overrides applied
    pub fn trace_config(&self) -> Result<TraceConfig> {
        let mut config = match &self.config {
            Some(path) => TraceConfig::from_toml(path)?,
            None => TraceConfig::default(),
        };
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(records) = self.capacity {
            config.capacities = BufferCapacities::uniform(records);
        }
        config.store_simd |= self.simd;
        config.store_fxsave |= self.fxsave;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn synth(args: &[&str]) -> SynthArgs {
        let cli = Cli::parse_from([&["peekaboo", "synth"], args].concat());
        match cli.command {
            Command::Synth(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_synth_defaults() {
        let args = synth(&[]);
        assert_eq!(args.count, 10_000);
        assert_eq!(args.mem_ops, 0);
        assert_eq!(args.threads, 1);
        assert!(args.fork_at.is_none());
        assert_eq!(args.name, "synthetic");
    }

    #[test]
    fn test_cli_inspect_json_flag() {
        let cli = Cli::parse_from(["peekaboo", "inspect", "/tmp/app-1", "--json"]);
        match cli.command {
            Command::Inspect {
                root,
                json,
                byte_map,
            } => {
                assert_eq!(root, PathBuf::from("/tmp/app-1"));
                assert!(json);
                assert!(!byte_map);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_debug_is_global() {
        let cli = Cli::parse_from(["peekaboo", "verify", "/tmp/x", "--debug"]);
        assert!(cli.debug);
    }

    #[test]
    fn test_cli_fork_conflicts_with_crash() {
        let result = Cli::try_parse_from([
            "peekaboo",
            "synth",
            "--fork-at",
            "5",
            "--crash-after",
            "5",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace.toml");
        fs::write(&path, "output_dir = \"/tmp/from-file\"\nstore_simd = false\n").unwrap();

        let args = synth(&[
            "--config",
            path.to_str().unwrap(),
            "--simd",
            "--capacity",
            "32",
        ]);
        let config = args.trace_config().unwrap();
        assert_eq!(config.output_dir, PathBuf::from("/tmp/from-file"));
        assert!(config.store_simd);
        assert_eq!(config.capacities.raw_byte_map, 32);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(synth(&["--capacity", "0"]).trace_config().is_err());
    }
}
