//! Command-line surface (§6.5): `clap` derive, mirroring the teacher's
//! `Cli { command, verbose }` shape.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "mergetrain",
    about = "Merge-request serialization bot: rebase, wait for CI, merge, one commit at a time",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Poll continuously until interrupted (daemon mode).
    Run,

    /// Scan every eligible project once, process what's ready, and exit.
    Once,

    /// Print the resolved configuration and its source path.
    Config {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_subcommand_parses() {
        let cli = Cli::parse_from(["mergetrain", "run"]);
        assert!(matches!(cli.command, Command::Run));
    }

    #[test]
    fn once_subcommand_parses() {
        let cli = Cli::parse_from(["mergetrain", "once"]);
        assert!(matches!(cli.command, Command::Once));
    }

    #[test]
    fn config_subcommand_parses_json_flag() {
        let cli = Cli::parse_from(["mergetrain", "config", "--json"]);
        match cli.command {
            Command::Config { json } => assert!(json),
            other => panic!("expected config command, got {other:?}"),
        }
    }

    #[test]
    fn verbose_count_accumulates() {
        let cli = Cli::parse_from(["mergetrain", "-vv", "run"]);
        assert_eq!(cli.verbose, 2);
    }
}
