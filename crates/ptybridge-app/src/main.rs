use std::fs::File;
use std::os::fd::AsFd;
use std::path::PathBuf;

use clap::Parser;
use ptybridge_pty::{BridgeConfig, WindowSize};
use tracing_subscriber::EnvFilter;

/// Spawn a command inside a PTY and proxy its I/O as newline-delimited JSON
/// over stdin/stdout.
#[derive(Parser, Debug)]
#[command(name = "pty-bridge", version)]
struct Cli {
    /// Working directory for the command.
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Initial terminal columns.
    #[arg(long, default_value_t = WindowSize::DEFAULT_COLS)]
    cols: u16,

    /// Initial terminal rows.
    #[arg(long, default_value_t = WindowSize::DEFAULT_ROWS)]
    rows: u16,

    /// Enable debug logs on stderr.
    #[arg(long)]
    debug: bool,

    /// Command to execute (prefix with -- to separate), e.g. `pty-bridge -- bash -l`.
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "COMMAND"
    )]
    command: Vec<String>,
}

impl Cli {
    fn into_config(self) -> BridgeConfig {
        let config = BridgeConfig::new(self.command).with_size(self.rows, self.cols);
        match self.cwd {
            Some(cwd) => config.with_cwd(cwd),
            None => config,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = cli.into_config();
    if let Err(e) = config.validate() {
        eprintln!("pty-bridge: {e}");
        std::process::exit(2);
    }

    // Read the control channel through an unbuffered descriptor so poll
    // readiness always matches what is left to read.
    let inbound = match std::io::stdin().as_fd().try_clone_to_owned() {
        Ok(fd) => File::from(fd),
        Err(e) => {
            eprintln!("pty-bridge: cannot open stdin: {e}");
            std::process::exit(1);
        }
    };

    match ptybridge_pty::run(&config, inbound, std::io::stdout().lock()) {
        Ok(Some(status)) => log::debug!("session finished: {status:?}"),
        Ok(None) => log::debug!("no session was started"),
        Err(e) => {
            log::error!("bridge failed: {e}");
            eprintln!("pty-bridge: {e}");
            std::process::exit(1);
        }
    }
}

/// Send diagnostics to stderr; stdout carries the protocol.
///
/// `RUST_LOG` wins when set. Otherwise `--debug` turns on debug output and
/// everything stays quiet without it.
fn init_logging(debug: bool) {
    let fallback = if debug { "debug" } else { "off" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .without_time()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["pty-bridge", "--", "bash"]).unwrap();
        assert!(!cli.debug);
        let config = cli.into_config();
        assert_eq!(config.command, vec!["bash".to_string()]);
        assert_eq!(config.size, WindowSize::new(30, 120));
        assert_eq!(config.cwd, None);
    }

    #[test]
    fn test_all_flags() {
        let cli = Cli::try_parse_from([
            "pty-bridge", "--cwd", "/tmp", "--cols", "100", "--rows", "40", "--debug", "--", "claude",
        ])
        .unwrap();
        assert!(cli.debug);
        let config = cli.into_config();
        assert_eq!(config.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(config.size, WindowSize::new(40, 100));
        assert_eq!(config.command, vec!["claude".to_string()]);
    }

    #[test]
    fn test_command_arguments_keep_their_dashes() {
        let cli = Cli::try_parse_from(["pty-bridge", "--", "ls", "-la", "--color=never"]).unwrap();
        assert_eq!(cli.command, vec!["ls", "-la", "--color=never"]);

        let cli = Cli::try_parse_from(["pty-bridge", "--rows", "10", "ls", "-la"]).unwrap();
        assert_eq!(cli.command, vec!["ls", "-la"]);
        assert_eq!(cli.rows, 10);
    }

    #[test]
    fn test_missing_command_is_rejected() {
        assert!(Cli::try_parse_from(["pty-bridge"]).is_err());
        assert!(Cli::try_parse_from(["pty-bridge", "--debug", "--"]).is_err());
    }

    #[test]
    fn test_verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
