//! Command-line interface for dump-relay.
//!
//! Uses lexopt to keep the binary small.

use std::ffi::OsString;
use std::net::IpAddr;
use std::path::PathBuf;

/// Command-line arguments. `None` means "not given; keep the config value".
#[derive(Debug, Clone, Default)]
pub struct Args {
    pub host: Option<IpAddr>,
    pub port: Option<u16>,
    /// Path to configuration file.
    pub config: Option<PathBuf>,
    /// Root directory for per-session workdirs.
    pub workdir: Option<PathBuf>,
    /// Inline output line threshold.
    pub truncate_lines: Option<usize>,
    /// Always run commands, never answer from the cache.
    pub no_cache: bool,
    pub log_level: Option<String>,
    pub version: bool,
    pub help: bool,
}

/// Parse command-line arguments.
pub fn parse_args() -> Result<Args, ArgsError> {
    parse_args_from(std::env::args_os())
}

/// Parse arguments from an iterator (for testing).
pub fn parse_args_from<I>(args: I) -> Result<Args, ArgsError>
where
    I: IntoIterator<Item = OsString>,
{
    use lexopt::prelude::*;

    let mut result = Args::default();
    let mut parser = lexopt::Parser::from_iter(args);

    while let Some(arg) = parser.next()? {
        match arg {
            Short('h') | Long("help") => result.help = true,
            Short('V') | Long("version") => result.version = true,
            Short('H') | Long("host") => {
                let value: String = parser.value()?.parse()?;
                result.host = Some(
                    value
                        .parse()
                        .map_err(|_| ArgsError::InvalidValue("host", value))?,
                );
            }
            Short('p') | Long("port") => {
                let value: String = parser.value()?.parse()?;
                result.port = Some(
                    value
                        .parse()
                        .map_err(|_| ArgsError::InvalidValue("port", value))?,
                );
            }
            Short('c') | Long("config") => {
                result.config = Some(parser.value()?.parse()?);
            }
            Short('w') | Long("workdir") => {
                result.workdir = Some(parser.value()?.parse()?);
            }
            Short('t') | Long("truncate-lines") => {
                let value: String = parser.value()?.parse()?;
                result.truncate_lines = Some(
                    value
                        .parse()
                        .map_err(|_| ArgsError::InvalidValue("truncate-lines", value))?,
                );
            }
            Long("no-cache") => result.no_cache = true,
            Short('l') | Long("log-level") => {
                result.log_level = Some(parser.value()?.parse()?);
            }
            Value(val) => {
                return Err(ArgsError::UnexpectedArgument(val.to_string_lossy().into()));
            }
            _ => return Err(arg.unexpected().into()),
        }
    }

    Ok(result)
}

/// Print help message.
pub fn print_help() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        r#"dump-relay {version}
Session-caching relay in front of crash and drgn for kernel dump analysis

USAGE:
    dump-relay [OPTIONS]

OPTIONS:
    -H, --host <ADDR>            Host address to bind [default: 127.0.0.1]
    -p, --port <PORT>            Port to listen on [default: 3000]
    -c, --config <FILE>          Path to configuration file (JSON)
    -w, --workdir <DIR>          Root for session workdirs [default: /tmp/dump-relay-sessions]
    -t, --truncate-lines <N>     Lines returned inline per command, 0 = all [default: 20]
        --no-cache               Always re-run commands
    -l, --log-level <LVL>        Log level (error, warn, info, debug, trace)
    -h, --help                   Print help
    -V, --version                Print version

ENVIRONMENT VARIABLES:
    DUMP_RELAY_HOST              Host address (overrides config)
    DUMP_RELAY_PORT              Port number (overrides config)
    DUMP_RELAY_WORKDIR           Session workdir root (overrides config)
    DUMP_RELAY_TRUNCATE_LINES    Inline line threshold (overrides config)
    DUMP_RELAY_CACHE             true/false, enable the command cache
    DUMP_RELAY_LOG_LEVEL         Log level (overrides config)
    RUST_LOG                     Full tracing filter

EXAMPLES:
    # Start with defaults (localhost:3000)
    dump-relay

    # Keep session output under /var/tmp and return 100 lines inline
    dump-relay -w /var/tmp/dump-relay -t 100

    # Start with config file
    dump-relay -c /etc/dump-relay/config.json
"#
    );
}

/// Print version.
pub fn print_version() {
    println!("dump-relay {}", env!("CARGO_PKG_VERSION"));
}

/// Argument parsing errors.
#[derive(Debug)]
pub enum ArgsError {
    /// Lexopt parsing error.
    Lexopt(lexopt::Error),
    /// Invalid argument value.
    InvalidValue(&'static str, String),
    /// Unexpected positional argument.
    UnexpectedArgument(String),
}

impl std::fmt::Display for ArgsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lexopt(e) => write!(f, "{}", e),
            Self::InvalidValue(name, value) => {
                write!(f, "invalid value for --{}: '{}'", name, value)
            }
            Self::UnexpectedArgument(arg) => {
                write!(f, "unexpected argument: '{}'", arg)
            }
        }
    }
}

impl std::error::Error for ArgsError {}

impl From<lexopt::Error> for ArgsError {
    fn from(e: lexopt::Error) -> Self {
        Self::Lexopt(e)
    }
}
