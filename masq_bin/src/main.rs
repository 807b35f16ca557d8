mod logger;

use std::fs::read_to_string;
use std::process::ExitCode;

use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::logger::LoggerType;

fn main() -> ExitCode {
    let matches = Command::new("masq")
        .subcommands([
            Command::new("version").about("Show current version"),
            Command::new("run")
                .about("Run the client with a configuration file")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .required(true)
                        .help("config file path"),
                )
                .arg(
                    Arg::new("verbose")
                        .short('v')
                        .long("verbose")
                        .action(ArgAction::SetTrue)
                        .help("verbose log"),
                ),
        ])
        .subcommand_required(true)
        .arg_required_else_help(true)
        .get_matches();

    match matches.subcommand() {
        Some(("version", _)) => {
            println!("masq version {}", masq_lib::version::VERSION);
            ExitCode::SUCCESS
        }
        Some(("run", matches)) => command_run(matches),
        _ => ExitCode::FAILURE,
    }
}

fn command_run(matches: &ArgMatches) -> ExitCode {
    let verbose = matches.get_flag("verbose");
    let Some(config_path) = matches.get_one::<String>("config") else {
        eprintln!("a configuration file must be provided via --config or -c");
        return ExitCode::FAILURE;
    };

    logger::init(if verbose {
        LoggerType::Verbose
    } else {
        LoggerType::Simple
    });

    let config = match read_to_string(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("cannot open the config path '{}': {}", config_path, err);
            return ExitCode::FAILURE;
        }
    };
    match masq_lib::start(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fatal: {}", err);
            ExitCode::FAILURE
        }
    }
}
