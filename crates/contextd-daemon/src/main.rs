//! contextd - context-property broker daemon.
//!
//! Providers publish raw signal values on `provider.sock` (mode 0600);
//! subscribers watch and query properties on `subscriber.sock` (mode 0660);
//! configured rules derive higher-level properties in between.
//!
//! # Fork Safety
//!
//! Daemonization via `fork()` MUST occur BEFORE the Tokio runtime starts.
//! `#[tokio::main]` spawns worker threads before the async body runs, and
//! calling `fork()` in a multi-threaded process is undefined behavior:
//! only the calling thread is duplicated, and mutexes held by other threads
//! stay locked forever in the child. This binary therefore uses a
//! synchronous `fn main()` that forks while truly single-threaded, THEN
//! constructs the runtime and enters the async entry point.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use contextd_core::config::BrokerConfig;
use contextd_daemon::daemon;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// contextd - context-property broker
#[derive(Parser, Debug)]
#[command(name = "contextd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to broker configuration file
    #[arg(short, long, default_value = "contextd.toml")]
    config: PathBuf,

    /// Run in foreground (don't daemonize)
    #[arg(long)]
    no_daemon: bool,

    /// Path to PID file
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Path to provider Unix socket (mode 0600, mutating plane)
    #[arg(long)]
    provider_socket: Option<PathBuf>,

    /// Path to subscriber Unix socket (mode 0660, read/notify plane)
    #[arg(long)]
    subscriber_socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Load the configuration and apply CLI overrides on top of it.
fn merged_config(args: &Args) -> Result<BrokerConfig> {
    let mut config =
        BrokerConfig::load_or_default(&args.config).context("failed to load configuration")?;
    if let Some(path) = &args.provider_socket {
        config.daemon.provider_socket = path.clone();
    }
    if let Some(path) = &args.subscriber_socket {
        config.daemon.subscriber_socket = path.clone();
    }
    if let Some(path) = &args.pid_file {
        config.daemon.pid_file = path.clone();
    }
    Ok(config)
}

/// Write the PID file, creating its directory (mode 0700) if missing.
fn write_pid_file(pid_path: &Path) -> Result<()> {
    if let Some(parent) = pid_path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).context("failed to create PID file directory")?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
                    .context("failed to set PID file directory permissions")?;
            }
        }
    }
    std::fs::write(pid_path, std::process::id().to_string())
        .context("failed to write PID file")?;
    info!("PID file written to {:?}", pid_path);
    Ok(())
}

/// Remove the PID file.
fn remove_pid_file(pid_path: &Path) {
    if pid_path.exists() {
        if let Err(e) = std::fs::remove_file(pid_path) {
            warn!("Failed to remove PID file: {e}");
        }
    }
}

/// Perform daemonization via the double-fork pattern.
///
/// # Safety
///
/// This function MUST be called BEFORE any multi-threaded runtime is
/// initialized. `fork()` in a multi-threaded process is undefined behavior:
/// only the calling thread is duplicated, mutexes held by worker threads
/// stay locked forever in the child, and thread-local state becomes
/// inconsistent. Calling it before `Runtime::new()` guarantees a
/// single-threaded process.
///
/// # Returns
///
/// - `Ok(true)` if daemonization succeeded (caller is the daemon child)
/// - `Ok(false)` if daemonization is not supported on this platform
/// - `Err(_)` if daemonization failed
#[allow(unsafe_code)] // fork() requires unsafe
fn daemonize() -> Result<bool> {
    #[cfg(unix)]
    {
        use nix::unistd::{fork, setsid, ForkResult};

        // First fork (double-fork daemon pattern)
        //
        // SAFETY: This is safe because we fork BEFORE the Tokio runtime is
        // initialized. The process is truly single-threaded at this point:
        // no worker threads, no async runtime, no library background
        // threads. The parent exits immediately; the child continues the
        // daemonization sequence.
        match unsafe { fork() }? {
            ForkResult::Parent { .. } => {
                // Parent exits immediately - daemon continues in child
                std::process::exit(0);
            },
            ForkResult::Child => {},
        }

        // Create new session - become session leader, lose controlling terminal
        setsid()?;

        // Second fork (completes double-fork daemon pattern)
        //
        // SAFETY: Still single-threaded - we are the first fork's child,
        // which inherited only the calling thread. This second fork ensures
        // the daemon cannot reacquire a controlling terminal.
        match unsafe { fork() }? {
            ForkResult::Parent { .. } => {
                // Intermediate parent exits - daemon continues in grandchild
                std::process::exit(0);
            },
            ForkResult::Child => {},
        }

        // Change to root directory to avoid holding directory handles
        std::env::set_current_dir("/")?;

        Ok(true)
    }

    #[cfg(not(unix))]
    {
        Ok(false)
    }
}

/// Synchronous entry point - handles daemonization BEFORE the runtime starts.
fn main() -> Result<()> {
    let args = Args::parse();

    // Daemonize if requested - MUST happen before any async runtime
    if !args.no_daemon {
        match daemonize() {
            // Daemonized (true) or platform doesn't support it (false);
            // either way continue into the runtime below.
            Ok(true | false) => {},
            Err(e) => {
                // Tracing is not initialized yet
                eprintln!("Daemonization failed: {e}");
                return Err(e);
            },
        }
    }

    // Safe now: either foreground, or we are the double-fork grandchild
    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

/// Async entry point - runs after daemonization is complete.
async fn async_main(args: Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    if args.no_daemon {
        info!("Running in foreground mode (--no-daemon)");
    } else {
        #[cfg(unix)]
        info!("Daemonized successfully");

        #[cfg(not(unix))]
        warn!("Daemonization not supported on this platform, running in foreground");
    }

    let config = merged_config(&args)?;

    let daemonized = !args.no_daemon;
    let pid_path = config.daemon.pid_file.clone();
    if daemonized {
        write_pid_file(&pid_path)?;
    }

    let result = daemon::serve(config).await;

    if daemonized {
        remove_pid_file(&pid_path);
    }

    result.context("broker terminated abnormally")
}

#[cfg(test)]
mod daemon_config_tests {
    use tempfile::TempDir;

    use super::*;

    fn args_with_config(config: PathBuf) -> Args {
        Args {
            config,
            no_daemon: true,
            pid_file: None,
            provider_socket: None,
            subscriber_socket: None,
            log_level: "info".to_string(),
            log_file: None,
        }
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let temp = TempDir::new().expect("create temp dir");
        let args = args_with_config(temp.path().join("missing-contextd.toml"));

        let config = merged_config(&args).expect("config should load");
        assert_eq!(config, BrokerConfig::default());
    }

    #[test]
    fn config_file_socket_paths_are_used() {
        let temp = TempDir::new().expect("create temp dir");
        let config_path = temp.path().join("contextd.toml");
        std::fs::write(
            &config_path,
            "[daemon]\n\
             provider_socket = \"/tmp/contextd/from-config.sock\"\n",
        )
        .expect("write config");

        let args = args_with_config(config_path);
        let config = merged_config(&args).expect("config should load");
        assert_eq!(
            config.daemon.provider_socket,
            PathBuf::from("/tmp/contextd/from-config.sock")
        );
    }

    #[test]
    fn cli_socket_override_beats_config_file() {
        let temp = TempDir::new().expect("create temp dir");
        let config_path = temp.path().join("contextd.toml");
        std::fs::write(
            &config_path,
            "[daemon]\n\
             provider_socket = \"/tmp/contextd/from-config.sock\"\n\
             subscriber_socket = \"/tmp/contextd/sub-config.sock\"\n",
        )
        .expect("write config");

        let mut args = args_with_config(config_path);
        args.provider_socket = Some(PathBuf::from("/tmp/contextd/from-cli.sock"));

        let config = merged_config(&args).expect("config should load");
        assert_eq!(
            config.daemon.provider_socket,
            PathBuf::from("/tmp/contextd/from-cli.sock")
        );
        // untouched fields keep the file's values
        assert_eq!(
            config.daemon.subscriber_socket,
            PathBuf::from("/tmp/contextd/sub-config.sock")
        );
    }

    #[test]
    fn cli_pid_file_override_is_applied() {
        let temp = TempDir::new().expect("create temp dir");
        let mut args = args_with_config(temp.path().join("missing.toml"));
        args.pid_file = Some(PathBuf::from("/tmp/contextd/custom.pid"));

        let config = merged_config(&args).expect("config should load");
        assert_eq!(
            config.daemon.pid_file,
            PathBuf::from("/tmp/contextd/custom.pid")
        );
    }

    #[test]
    fn pid_file_round_trip() {
        let temp = TempDir::new().expect("create temp dir");
        let pid_path = temp.path().join("run").join("contextd.pid");

        write_pid_file(&pid_path).expect("write pid file");
        let contents = std::fs::read_to_string(&pid_path).expect("read pid file");
        assert_eq!(contents, std::process::id().to_string());

        remove_pid_file(&pid_path);
        assert!(!pid_path.exists());
    }
}
