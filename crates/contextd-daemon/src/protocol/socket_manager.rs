//! Dual-socket manager separating the mutating and observing planes.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                SocketManager                  │
//! │  ┌──────────────────┐  ┌──────────────────┐   │
//! │  │  provider.sock   │  │ subscriber.sock  │   │
//! │  │  (mode 0600)     │  │  (mode 0660)     │   │
//! │  │  publish values  │  │  watch + query   │   │
//! │  └────────┬─────────┘  └────────┬─────────┘   │
//! │           └───────────┬─────────┘             │
//! │                       ▼                       │
//! │            (UnixStream, SocketType)           │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Providers write property values, so their socket is owner-only;
//! subscribers only observe and get the group-readable socket. The plane is
//! determined by which socket accepted the connection, never by anything
//! the client says.
//!
//! Bind-time hygiene: the parent directory is created 0700 when missing and
//! refused when it is a symlink; stale socket files are removed only when
//! they really are sockets; permissions are set after binding.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use contextd_core::config::runtime_dir;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::error::{ProtocolError, ProtocolResult};

/// Default socket filenames under the runtime directory.
const PROVIDER_SOCKET_NAME: &str = "provider.sock";
const SUBSCRIBER_SOCKET_NAME: &str = "subscriber.sock";

/// Default maximum concurrent connections across both sockets.
const MAX_CONNECTIONS: usize = 256;

/// Provider socket permissions (owner read/write only).
const PROVIDER_SOCKET_MODE: u32 = 0o600;

/// Subscriber socket permissions (owner + group read/write).
const SUBSCRIBER_SOCKET_MODE: u32 = 0o660;

/// Directory permissions (owner only), applied only when we create it.
const DIRECTORY_MODE: u32 = 0o700;

/// Which plane a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    /// Provider socket: may declare and update properties.
    Provider,
    /// Subscriber socket: may watch and query only.
    Subscriber,
}

impl SocketType {
    /// Returns `true` if connections on this socket mutate the store.
    #[must_use]
    pub const fn is_mutating(self) -> bool {
        matches!(self, Self::Provider)
    }
}

impl std::fmt::Display for SocketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provider => write!(f, "provider"),
            Self::Subscriber => write!(f, "subscriber"),
        }
    }
}

/// Default provider socket path: `$XDG_RUNTIME_DIR/contextd/provider.sock`,
/// falling back to `/tmp/contextd/provider.sock`.
#[must_use]
pub fn default_provider_socket_path() -> PathBuf {
    runtime_dir().join(PROVIDER_SOCKET_NAME)
}

/// Default subscriber socket path, next to the provider socket.
#[must_use]
pub fn default_subscriber_socket_path() -> PathBuf {
    runtime_dir().join(SUBSCRIBER_SOCKET_NAME)
}

/// Configuration for the dual-socket manager.
#[derive(Debug, Clone)]
pub struct SocketManagerConfig {
    /// Provider socket path (mode 0600).
    pub provider_socket_path: PathBuf,

    /// Subscriber socket path (mode 0660).
    pub subscriber_socket_path: PathBuf,

    /// Maximum concurrent connections across both sockets.
    pub max_connections: usize,
}

impl Default for SocketManagerConfig {
    fn default() -> Self {
        Self {
            provider_socket_path: default_provider_socket_path(),
            subscriber_socket_path: default_subscriber_socket_path(),
            max_connections: MAX_CONNECTIONS,
        }
    }
}

impl SocketManagerConfig {
    /// Create a config with the given socket paths.
    #[must_use]
    pub fn new(
        provider_socket_path: impl Into<PathBuf>,
        subscriber_socket_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            provider_socket_path: provider_socket_path.into(),
            subscriber_socket_path: subscriber_socket_path.into(),
            ..Default::default()
        }
    }

    /// Set the maximum concurrent connections.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

/// Owns both listeners and the connection admission semaphore.
#[derive(Debug)]
pub struct SocketManager {
    config: SocketManagerConfig,
    provider_listener: UnixListener,
    subscriber_listener: UnixListener,
    connection_sem: Arc<Semaphore>,
}

impl SocketManager {
    /// Create and bind both sockets.
    ///
    /// Creates the parent directory if needed (mode 0700), removes stale
    /// socket files, binds, and applies the per-plane modes.
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be created or is a symlink, a stale
    /// path exists but is not a socket, a bind fails, or permissions cannot
    /// be applied.
    pub fn bind(config: SocketManagerConfig) -> ProtocolResult<Self> {
        if let Some(parent) = config.provider_socket_path.parent() {
            Self::ensure_directory(parent)?;
        }
        if let Some(parent) = config.subscriber_socket_path.parent() {
            if config.subscriber_socket_path.parent() != config.provider_socket_path.parent() {
                Self::ensure_directory(parent)?;
            }
        }

        Self::cleanup_socket(&config.provider_socket_path)?;
        Self::cleanup_socket(&config.subscriber_socket_path)?;

        let provider_listener = UnixListener::bind(&config.provider_socket_path).map_err(|e| {
            ProtocolError::Io(io::Error::new(
                e.kind(),
                format!(
                    "failed to bind provider socket to {}: {e}",
                    config.provider_socket_path.display()
                ),
            ))
        })?;
        Self::set_socket_permissions(&config.provider_socket_path, PROVIDER_SOCKET_MODE)?;

        let subscriber_listener =
            UnixListener::bind(&config.subscriber_socket_path).map_err(|e| {
                ProtocolError::Io(io::Error::new(
                    e.kind(),
                    format!(
                        "failed to bind subscriber socket to {}: {e}",
                        config.subscriber_socket_path.display()
                    ),
                ))
            })?;
        Self::set_socket_permissions(&config.subscriber_socket_path, SUBSCRIBER_SOCKET_MODE)?;

        info!(
            provider_socket = %config.provider_socket_path.display(),
            subscriber_socket = %config.subscriber_socket_path.display(),
            max_connections = config.max_connections,
            "Dual-socket manager bound"
        );

        Ok(Self {
            connection_sem: Arc::new(Semaphore::new(config.max_connections)),
            config,
            provider_listener,
            subscriber_listener,
        })
    }

    /// Ensure a directory exists.
    ///
    /// Does not modify permissions of directories that already exist (a
    /// misconfigured path must not clobber a system directory like `/tmp`);
    /// 0700 is enforced only on directories this call creates. Symlinks are
    /// refused outright.
    fn ensure_directory(path: &Path) -> ProtocolResult<()> {
        match std::fs::symlink_metadata(path) {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() {
                    return Err(ProtocolError::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!(
                            "{} is a symlink, refusing to use as socket directory",
                            path.display()
                        ),
                    )));
                }
                if !metadata.is_dir() {
                    return Err(ProtocolError::Io(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{} exists but is not a directory", path.display()),
                    )));
                }
                Ok(())
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                std::fs::create_dir_all(path).map_err(|e| {
                    ProtocolError::Io(io::Error::new(
                        e.kind(),
                        format!("failed to create directory {}: {e}", path.display()),
                    ))
                })?;

                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let perms = std::fs::Permissions::from_mode(DIRECTORY_MODE);
                    std::fs::set_permissions(path, perms).map_err(|e| {
                        ProtocolError::Io(io::Error::new(
                            e.kind(),
                            format!("failed to set permissions on {}: {e}", path.display()),
                        ))
                    })?;
                }
                Ok(())
            },
            Err(e) => Err(ProtocolError::Io(io::Error::new(
                e.kind(),
                format!("failed to stat {}: {e}", path.display()),
            ))),
        }
    }

    #[cfg(unix)]
    fn set_socket_permissions(path: &Path, mode: u32) -> ProtocolResult<()> {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(mode);
        std::fs::set_permissions(path, perms).map_err(|e| {
            ProtocolError::Io(io::Error::new(
                e.kind(),
                format!(
                    "failed to set socket permissions on {}: {e}",
                    path.display()
                ),
            ))
        })
    }

    #[cfg(not(unix))]
    fn set_socket_permissions(_path: &Path, _mode: u32) -> ProtocolResult<()> {
        Ok(())
    }

    /// Remove a stale socket file if it exists; anything else at the path
    /// is an error.
    fn cleanup_socket(path: &Path) -> ProtocolResult<()> {
        if path.exists() {
            let metadata = std::fs::symlink_metadata(path).map_err(|e| {
                ProtocolError::Io(io::Error::new(
                    e.kind(),
                    format!("failed to stat {}: {e}", path.display()),
                ))
            })?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::FileTypeExt;
                if !metadata.file_type().is_socket() {
                    return Err(ProtocolError::Io(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("path {} exists but is not a socket", path.display()),
                    )));
                }
            }

            std::fs::remove_file(path).map_err(|e| {
                ProtocolError::Io(io::Error::new(
                    e.kind(),
                    format!("failed to remove stale socket {}: {e}", path.display()),
                ))
            })?;

            debug!(path = %path.display(), "Removed stale socket file");
        }

        Ok(())
    }

    /// Accept the next connection from either socket.
    ///
    /// Waits for an admission permit first, so the connection count across
    /// both planes never exceeds the configured bound; the permit must be
    /// held for the connection's lifetime.
    ///
    /// # Errors
    ///
    /// Propagates accept failures; the caller decides whether to retry.
    pub async fn accept(&self) -> ProtocolResult<(UnixStream, OwnedSemaphorePermit, SocketType)> {
        let permit = self
            .connection_sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProtocolError::Io(io::Error::other("connection semaphore closed")))?;

        let (stream, socket_type) = tokio::select! {
            result = self.provider_listener.accept() => {
                let (stream, _addr) = result?;
                (stream, SocketType::Provider)
            }
            result = self.subscriber_listener.accept() => {
                let (stream, _addr) = result?;
                (stream, SocketType::Subscriber)
            }
        };

        debug!(socket_type = %socket_type, "Accepted new connection");

        Ok((stream, permit, socket_type))
    }

    /// Returns the provider socket path.
    #[must_use]
    pub fn provider_socket_path(&self) -> &Path {
        &self.config.provider_socket_path
    }

    /// Returns the subscriber socket path.
    #[must_use]
    pub fn subscriber_socket_path(&self) -> &Path {
        &self.config.subscriber_socket_path
    }

    /// Remove both socket files. Called on shutdown.
    ///
    /// # Errors
    ///
    /// Collects removal failures from both paths into one error.
    pub fn cleanup(&self) -> ProtocolResult<()> {
        let mut errors = Vec::new();

        for path in [
            &self.config.provider_socket_path,
            &self.config.subscriber_socket_path,
        ] {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    errors.push(format!("failed to remove socket {}: {e}", path.display()));
                } else {
                    info!(socket_path = %path.display(), "Removed socket file");
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::Io(io::Error::other(errors.join("; "))))
        }
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        // Best-effort cleanup on drop
        if let Err(e) = self.cleanup() {
            warn!("Failed to cleanup sockets on drop: {e}");
        }
    }
}
