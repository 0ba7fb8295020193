use std::env;
use std::process;

/// Prints usage instructions for the program.
pub fn print_usage() {
    println!("Usage: {} [-h] [-v] [-d] [-l logfile] config_file", crate::PROGRAM_NAME);
}

/// Options for a normal run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    /// Path to the JSON configuration file
    pub config_file: String,
    /// Path to log file (None for stdout)
    pub log_file: Option<String>,
    /// Emit debug messages
    pub debug: bool,
}

/// What the command line asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Run(CliArgs),
    Help,
    Version,
}

/// Parses an argument list, program name already skipped
///
/// # Errors
/// A message suitable for printing before the usage line
pub fn parse_arg_list<I: IntoIterator<Item = String>>(args: I) -> Result<CliCommand, String> {
    let mut log_file = None;
    let mut debug = false;
    let mut config_file = None;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" => return Ok(CliCommand::Help),
            "-v" => return Ok(CliCommand::Version),
            "-d" => debug = true,
            "-l" => {
                log_file = Some(args.next().ok_or("Missing log file argument")?);
            }
            _ if arg.starts_with('-') => return Err(format!("Unknown option: {}", arg)),
            _ => {
                if config_file.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config_file = Some(arg);
            }
        }
    }

    let config_file = config_file.ok_or("Missing config file argument")?;
    Ok(CliCommand::Run(CliArgs {
        config_file,
        log_file,
        debug,
    }))
}

/// Parses the process arguments
///
/// Prints usage or version and exits for `-h` / `-v`; prints the error and
/// usage and exits with status 1 on bad input.
pub fn parse_args() -> CliArgs {
    match parse_arg_list(env::args().skip(1)) {
        Ok(CliCommand::Run(args)) => args,
        Ok(CliCommand::Help) => {
            print_usage();
            process::exit(0);
        }
        Ok(CliCommand::Version) => {
            println!("{} version {}", crate::PROGRAM_NAME, crate::PROGRAM_VERSION);
            process::exit(0);
        }
        Err(message) => {
            eprintln!("Error: {}", message);
            print_usage();
            process::exit(1);
        }
    }
}
