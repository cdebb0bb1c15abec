use clap::{Parser, Subcommand};
use gpu_driver_installer::errors::is_config;
use gpu_driver_installer::logging;
use std::process::ExitCode;
use tracing::error;

mod commands;

#[derive(Parser)]
#[command(
    name = "gpu-driver-installer",
    version,
    about = "Install GPU drivers on container-optimized Linux hosts"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download, link, sign, load and verify the GPU driver
    Install(commands::install::InstallArgs),
    /// List the driver versions published for this build
    List(commands::list::ListArgs),
    /// List all subcommand names
    Commands,
    /// Describe the flags of a subcommand
    Flags(commands::FlagsArgs),
}

impl Cli {
    fn debug(&self) -> bool {
        match &self.command {
            Commands::Install(args) => args.debug,
            Commands::List(args) => args.debug,
            Commands::Commands | Commands::Flags(_) => false,
        }
    }
}

fn main() -> ExitCode {
    // Usage errors exit with status 2 inside parse().
    let cli = Cli::parse();
    let debug = cli.debug();
    logging::init(debug);

    let result = match cli.command {
        Commands::Install(args) => commands::install::run(args),
        Commands::List(args) => commands::list::run(args),
        Commands::Commands => commands::print_commands::<Cli>(),
        Commands::Flags(args) => commands::print_flags::<Cli>(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if debug {
                error!("{:?}", e);
            } else {
                error!("{:#}", e);
            }
            if is_config(&e) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
