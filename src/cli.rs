use std::path::PathBuf;

use clap::Parser;

use crate::config::Board;
use crate::logging::LogArgs;
use crate::sync::Mechanism;

#[derive(Debug, Parser)]
#[command(
    name = "rtbench",
    about = "Periodic real-time task and synchronization latency benchmark"
)]
pub struct Cli {
    /// Test duration in seconds (maximum 3600 for a 1 ms periodic task)
    #[arg(short = 'T', long = "duration")]
    pub duration: Option<u64>,

    /// Evaluate periodicity of 1 or 2 task(s)
    #[arg(short = 'p', long = "periodic")]
    pub periodic: Option<u8>,

    /// Evaluate periodicity with a real-time synchronization mechanism
    #[arg(short = 'm', long = "mechanism", value_enum)]
    pub mechanism: Option<Mechanism>,

    /// Capture oscilloscope-like edge timestamps of the first ticks
    #[arg(short = 'o', long = "oscilloscope")]
    pub oscilloscope: bool,

    /// Board under test; prefixes every result file
    #[arg(long, value_enum)]
    pub board: Option<Board>,

    /// Directory the result files are written to (default: ./results)
    #[arg(long = "results-dir")]
    pub results_dir: Option<PathBuf>,

    /// Run tasks under SCHED_OTHER instead of SCHED_FIFO
    #[arg(long = "no-realtime")]
    pub no_realtime: bool,

    /// Configuration file path (default: /etc/rtbench.toml)
    #[arg(long = "config")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub log: LogArgs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_mechanism_short_names() {
        let cli = Cli::try_parse_from(["rtbench", "-T", "10", "-m", "msg", "-o"]).unwrap();
        assert_eq!(cli.duration, Some(10));
        assert_eq!(cli.mechanism, Some(Mechanism::MessageQueue));
        assert!(cli.oscilloscope);
        assert_eq!(cli.periodic, None);
    }

    #[test]
    fn test_parse_rejects_unknown_mechanism() {
        assert!(Cli::try_parse_from(["rtbench", "-m", "spinlock"]).is_err());
    }

    #[test]
    fn test_parse_board_and_periodic() {
        let cli = Cli::try_parse_from(["rtbench", "-p", "2", "--board", "rpi3"]).unwrap();
        assert_eq!(cli.periodic, Some(2));
        assert_eq!(cli.board, Some(Board::Rpi3));
    }
}
