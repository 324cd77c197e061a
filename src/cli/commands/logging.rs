use clap::{builder::ValueParser, Arg, ArgAction, Command};
use tracing::Level;

pub const ARG_VERBOSITY: &str = "verbosity";

const LEVELS: [Level; 5] = [
    Level::ERROR,
    Level::WARN,
    Level::INFO,
    Level::DEBUG,
    Level::TRACE,
];

/// `SSOGATE_LOG_LEVEL` accepts a count (`0`-`5`) or a level name; both map to
/// the same count `-v` flags produce.
fn parse_log_level(value: &str) -> Result<u8, String> {
    if let Ok(count) = value.trim().parse::<u8>() {
        return if count <= 5 {
            Ok(count)
        } else {
            Err(format!("invalid log level: {value}"))
        };
    }

    let level = value
        .trim()
        .parse::<Level>()
        .map_err(|_| format!("invalid log level: {value}"))?;
    LEVELS
        .iter()
        .position(|candidate| *candidate == level)
        .and_then(|index| u8::try_from(index).ok())
        .ok_or_else(|| format!("invalid log level: {value}"))
}

#[must_use]
pub fn validator_log_level() -> ValueParser {
    ValueParser::new(parse_log_level)
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command.arg(
        Arg::new(ARG_VERBOSITY)
            .short('v')
            .long("verbose")
            .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
            .env("SSOGATE_LOG_LEVEL")
            .global(true)
            .action(ArgAction::Count)
            .value_parser(validator_log_level()),
    )
}
