use std::{net::SocketAddr, path::PathBuf};

use anyhow::{ensure, Result};
use clap::{Args, Parser, Subcommand};

use crate::{bet::AgencyId, settlement::WinningNumber};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the lottery central, accepting bets from agencies over TCP.
    Server(ServerArgs),
    /// Submit an agency's bets to the central and wait for its winners.
    Agency(AgencyArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, env = "SERVER_LISTEN", default_value = "0.0.0.0:12345")]
    pub listen: SocketAddr,

    /// Pending-connection backlog of the listening socket.
    #[arg(long, env = "SERVER_LISTEN_BACKLOG", default_value_t = 5)]
    pub backlog: u32,

    /// Maximum number of agency connections served at the same time.
    #[arg(long, env = "MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: usize,

    /// Number of agencies that must finish before winners are announced.
    #[arg(long, env = "TOTAL_AGENCIES", default_value_t = 5)]
    pub agencies: AgencyId,

    /// Lottery number that wins the draw.
    #[arg(long, env = "WINNING_NUMBER", default_value_t = WinningNumber::DEFAULT.0)]
    pub winning_number: u64,

    /// Append accepted bets to this CSV file instead of keeping them in memory.
    #[arg(long, env = "BETS_FILE")]
    pub bets_file: Option<PathBuf>,
}

impl ServerArgs {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_connections > 0, "max connections must be at least 1");
        ensure!(self.agencies > 0, "at least one agency is required");
        Ok(())
    }
}

#[derive(Args, Debug, Clone)]
pub struct AgencyArgs {
    /// Agency identifier, starting at 1.
    #[arg(long, env = "CLI_ID")]
    pub id: AgencyId,

    /// Address of the central.
    #[arg(long, env = "SERVER_ADDRESS", default_value = "127.0.0.1:12345")]
    pub server: String,

    /// CSV file with `first_name,last_name,document,birth_date,number` rows.
    #[arg(long, env = "BETS_FILE")]
    pub bets_file: PathBuf,

    /// Maximum number of bets per batch.
    #[arg(long, env = "BATCH_MAX_AMOUNT", default_value_t = 100)]
    pub batch_size: usize,

    /// Maximum encoded size of a batch frame in bytes.
    #[arg(long, default_value_t = 8192)]
    pub batch_limit_bytes: usize,

    /// Delay before asking again after a pending answer.
    #[arg(long, default_value_t = 500)]
    pub retry_interval_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let cli = Cli::try_parse_from(["lottery_central", "server", "--agencies", "2"])
            .expect("parse server args");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert_eq!(args.agencies, 2);
        assert_eq!(args.backlog, 5);
        assert_eq!(args.winning_number, WinningNumber::DEFAULT.0);
        assert!(args.bets_file.is_none());
        args.validate().expect("valid defaults");
    }

    #[test]
    fn zero_agencies_is_invalid() {
        let cli = Cli::try_parse_from(["lottery_central", "server", "--agencies", "0"])
            .expect("parse server args");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert!(args.validate().is_err());
    }
}
