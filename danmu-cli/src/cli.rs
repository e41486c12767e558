use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "danmu",
    version,
    about = "Watch, decode and merge live danmaku streams",
    long_about = None
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true, env = "DANMU_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a live room and print its events
    Watch {
        /// Danmaku WebSocket URL (ws:// or wss://)
        url: String,

        /// Room id sent in the auth frame
        #[arg(short, long)]
        room_id: u64,

        /// Auth token (the `key` field of the auth frame)
        #[arg(short, long, env = "DANMU_TOKEN", default_value = "")]
        token: String,

        /// User id sent in the auth frame, 0 for anonymous
        #[arg(short, long, default_value_t = 0)]
        uid: u64,

        /// Merge chat into batches and highlights instead of printing it raw
        #[arg(short, long)]
        merge: bool,

        /// Merge batch window in milliseconds (overrides config)
        #[arg(long)]
        batch_window_ms: Option<i64>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Pretty)]
        output: OutputFormat,
    },

    /// Decode a captured binary frame buffer
    Decode {
        /// Input file, stdin when omitted
        file: Option<PathBuf>,

        /// Input is hex text rather than raw bytes
        #[arg(long)]
        hex: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Pretty)]
        output: OutputFormat,
    },

    /// Run the merge engine over a JSON array of display messages
    Merge {
        /// Input file, stdin when omitted
        file: Option<PathBuf>,

        /// Clustering window for ordinary groups in milliseconds (overrides config)
        #[arg(short, long)]
        interval_ms: Option<i64>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Pretty)]
        output: OutputFormat,
    },

    /// Show or reset configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,

        /// Reset configuration to defaults
        #[arg(long)]
        reset: bool,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// Pretty-printed JSON
    Json,
    /// One JSON document per line
    JsonCompact,
}

impl OutputFormat {
    pub fn is_json(self) -> bool {
        matches!(self, Self::Json | Self::JsonCompact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_watch() {
        let args = Args::try_parse_from([
            "danmu",
            "watch",
            "wss://example.com/sub",
            "--room-id",
            "42",
            "--merge",
            "-o",
            "json-compact",
        ])
        .unwrap();

        match args.command {
            Commands::Watch {
                url,
                room_id,
                uid,
                merge,
                output,
                ..
            } => {
                assert_eq!(url, "wss://example.com/sub");
                assert_eq!(room_id, 42);
                assert_eq!(uid, 0);
                assert!(merge);
                assert_eq!(output, OutputFormat::JsonCompact);
            }
            other => panic!("Unexpected command: {other:?}"),
        }
    }
}
