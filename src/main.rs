use std::io;
use std::process;
use std::sync::Arc;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use tracing::error;

use rschimg::executor::RealCommandExecutor;
use rschimg::{cli, init_logging, run_apply, run_validate};

fn main() -> Result<()> {
    let args = cli::Cli::parse();

    match &args.command {
        cli::Commands::Apply(opts) => {
            init_logging(opts.common.log_level)?;
            let executor = Arc::new(RealCommandExecutor);
            if let Err(e) = run_apply(opts, executor) {
                error!("apply failed: {:#}", e);
                process::exit(1);
            }
        }
        cli::Commands::Validate(opts) => {
            init_logging(opts.common.log_level)?;
            if let Err(e) = run_validate(opts) {
                error!("validation failed: {:#}", e);
                process::exit(1);
            }
        }
        cli::Commands::Completions(opts) => {
            let mut cmd = cli::Cli::command();
            let name = cmd.get_name().to_string();
            generate(opts.shell, &mut cmd, name, &mut io::stdout());
        }
    }

    Ok(())
}
