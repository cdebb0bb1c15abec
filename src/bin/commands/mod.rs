pub mod install;
pub mod list;

use anyhow::{bail, Result};
use clap::{Args, CommandFactory};

#[derive(Args, Debug)]
pub struct FlagsArgs {
    /// Subcommand to describe; all of them when omitted
    pub subcommand: Option<String>,
}

pub fn print_commands<C: CommandFactory>() -> Result<()> {
    for sub in C::command().get_subcommands() {
        println!("{}", sub.get_name());
    }
    println!("help");
    Ok(())
}

pub fn print_flags<C: CommandFactory>(args: FlagsArgs) -> Result<()> {
    let cli = C::command();
    let subs: Vec<&clap::Command> = match args.subcommand.as_deref() {
        Some(name) => match cli.find_subcommand(name) {
            Some(sub) => vec![sub],
            None => bail!("unknown subcommand {:?}", name),
        },
        None => cli.get_subcommands().collect(),
    };

    for sub in subs {
        let flags: Vec<_> = sub.get_arguments().filter(|a| a.get_long().is_some()).collect();
        if flags.is_empty() {
            continue;
        }
        println!("{}:", sub.get_name());
        for flag in flags {
            let long = flag.get_long().unwrap_or_default();
            let help = flag.get_help().map(|h| h.to_string()).unwrap_or_default();
            println!("  --{:<24} {}", long, help);
        }
    }
    Ok(())
}
