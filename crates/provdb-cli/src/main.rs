use clap::Parser;
use provdb_cli::{logging, run_cli, Cli};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.debug())?;
    run_cli(cli)
}
