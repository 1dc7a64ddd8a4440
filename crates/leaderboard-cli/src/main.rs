use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = leaderboard_cli::Cli::parse();
    leaderboard_cli::init_logging(cli.log_format(), cli.log_level())?;
    leaderboard_cli::run_cli(cli)
}
