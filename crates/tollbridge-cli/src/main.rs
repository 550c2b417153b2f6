mod cli;
mod commands;
mod concierge;
mod exec_credential;
mod output;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Commands, LoginCommands};
use commands::login_static::StaticLoginDeps;
use output::print_error;

#[tokio::main]
async fn main() {
    output::init_tracing();
    if let Err(e) = run().await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Login(login) => match &login.command {
            LoginCommands::Static(args) => {
                let mut stdout = std::io::stdout().lock();
                commands::login_static::run(args, &StaticLoginDeps::real(), &mut stdout).await?;
            }
        },
    }

    Ok(())
}
