mod config;
mod line;
mod signals;
mod stream;
mod supervisor;
mod verdict;
mod watchdog;

use clap::Parser;
use config::{Config, DEFAULT_CONFIG_FILE};
use signals::SignalHandler;
use std::path::PathBuf;
use std::process::ExitCode;
use supervisor::{ProcessSupervisor, RunOptions, RunReport, SupervisorError};
use tracing_subscriber::EnvFilter;

/// Exit code for runs that never reached a verdict.
const EXIT_FATAL: u8 = 2;

/// Run a command on two pseudo-terminals, stream its output line by line,
/// kill it if it goes quiet, and exit 0 only if its last line is the
/// success sentinel.
#[derive(Parser, Debug)]
#[command(name = "ptywatch", version, about)]
pub struct Cli {
    /// Command and arguments to run (overrides config)
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,

    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Idle timeout in seconds (overrides config)
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Success sentinel line (overrides config)
    #[arg(long)]
    sentinel: Option<String>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (stream and watchdog events)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors on stderr
    #[arg(short, long)]
    quiet: bool,
}

/// Process exit code for a finished or aborted run.
fn exit_code(result: &Result<RunReport, SupervisorError>) -> u8 {
    match result {
        Ok(report) => report.verdict.exit_code(),
        Err(_) => EXIT_FATAL,
    }
}

impl Cli {
    fn resolve_config(&self) -> Result<Config, config::ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::load(path, true)?,
            None => Config::load(&PathBuf::from(DEFAULT_CONFIG_FILE), false)?,
        };

        if let Some((program, args)) = self.command.split_first() {
            config.command.program = program.clone();
            config.command.args = args.to_vec();
        }
        if let Some(timeout) = self.timeout {
            config.watchdog.idle_timeout_secs = timeout;
        }
        if let Some(sentinel) = &self.sentinel {
            config.verdict.sentinel = sentinel.clone();
        }

        config.validate()?;
        Ok(config)
    }

    fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match cli.resolve_config() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    if cli.dry_run {
        match toml::to_string_pretty(&config) {
            Ok(rendered) => {
                print!("{rendered}");
                return ExitCode::SUCCESS;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to render config");
                return ExitCode::from(EXIT_FATAL);
            }
        }
    }

    let mut signals = match SignalHandler::install() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            return ExitCode::from(EXIT_FATAL);
        }
    };
    let shutdown = async move {
        let reason = signals.recv().await;
        tracing::warn!(signal = %reason, "received shutdown signal");
    };

    let mut supervisor = ProcessSupervisor::new(RunOptions::from(&config), std::io::stdout());
    let result = supervisor.run(shutdown).await;
    match &result {
        Ok(report) => {
            tracing::info!(
                pid = report.pid,
                verdict = ?report.verdict,
                termination = ?report.termination,
                exit_status = ?report.exit_status,
                lines = report.lines.len(),
                duration_secs = report.duration.as_secs_f64(),
                "run completed"
            );
        }
        Err(e) => tracing::error!(error = %e, "run aborted"),
    }
    ExitCode::from(exit_code(&result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_command_overrides_config() {
        let cli = Cli::parse_from(["ptywatch", "--timeout", "3", "--", "make", "-j4", "check"]);
        assert_eq!(cli.command, vec!["make", "-j4", "check"]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ptywatch.toml");
        std::fs::write(&path, "[command]\nprogram = \"pros\"\n").unwrap();
        let cli = Cli {
            config: Some(path),
            ..cli
        };
        let config = cli.resolve_config().unwrap();
        assert_eq!(config.command.program, "make");
        assert_eq!(config.command.args, vec!["-j4", "check"]);
        assert_eq!(config.watchdog.idle_timeout_secs, 3);
    }

    #[test]
    fn test_command_without_separator() {
        let cli = Cli::parse_from(["ptywatch", "-q", "pytest", "-x"]);
        assert_eq!(cli.command, vec!["pytest", "-x"]);
        assert!(cli.quiet);
        assert_eq!(cli.log_level(), "warn");
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ptywatch.toml");
        std::fs::write(&path, "").unwrap();
        let cli = Cli::parse_from([
            "ptywatch",
            "--config",
            path.to_str().unwrap(),
            "--timeout",
            "0",
        ]);
        assert!(cli.resolve_config().is_err());
    }

    #[test]
    fn test_sentinel_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ptywatch.toml");
        std::fs::write(&path, "[verdict]\nsentinel = \"PASS\"\n").unwrap();
        let cli = Cli::parse_from([
            "ptywatch",
            "-c",
            path.to_str().unwrap(),
            "--sentinel",
            "DONE",
        ]);
        assert_eq!(cli.resolve_config().unwrap().verdict.sentinel, "DONE");
        assert_eq!(cli.log_level(), "info");
    }

    fn report(verdict: verdict::Verdict) -> RunReport {
        RunReport {
            verdict,
            exit_status: Some(0),
            termination: supervisor::Termination::Natural,
            lines: Vec::new(),
            duration: std::time::Duration::ZERO,
            pid: 1,
        }
    }

    #[test]
    fn test_exit_code_follows_verdict() {
        assert_eq!(exit_code(&Ok(report(verdict::Verdict::Success))), 0);
        assert_eq!(exit_code(&Ok(report(verdict::Verdict::Failure))), 1);
    }

    #[test]
    fn test_read_error_exits_fatal() {
        let err = SupervisorError::Read {
            stream: line::StreamTag::Stdout,
            source: std::io::Error::from_raw_os_error(9),
        };
        assert_eq!(exit_code(&Err(err)), EXIT_FATAL);
    }

    #[test]
    fn test_verbose_log_level() {
        let cli = Cli::parse_from(["ptywatch", "-v"]);
        assert_eq!(cli.log_level(), "debug");
    }
}
