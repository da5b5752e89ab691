use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{parse_numeric, LineageError};
use crate::models::{keys, ExtractionRequest};
use crate::services::transport::{
    HostKeyPolicy, RemoteTarget, RemoteTransport, SessionGuard, SftpTransport,
};

pub const DEFAULT_LOG_DIR: &str = "/usr/local/lhotse_runners/log/";
pub const DEFAULT_REMOTE_PORT: u16 = 22;
pub const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 30_000;

/// Where the log of a request lives, resolved from its properties
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSource {
    Local {
        base_dir: PathBuf,
    },
    Remote {
        target: RemoteTarget,
        remote_base_dir: PathBuf,
        local_base_dir: PathBuf,
    },
}

impl LogSource {
    pub fn from_request(request: &ExtractionRequest) -> Result<Self, LineageError> {
        let local_base_dir = PathBuf::from(request.property(keys::LOCAL_LOG_DIR).unwrap_or(DEFAULT_LOG_DIR));

        let remote = match request.property(keys::LOG_REMOTE) {
            None => false,
            Some(flag) if flag.eq_ignore_ascii_case("false") => false,
            Some(flag) if flag.eq_ignore_ascii_case("true") => true,
            Some(other) => {
                return Err(LineageError::Config(format!(
                    "{} must be true or false, got {:?}",
                    keys::LOG_REMOTE,
                    other
                )))
            }
        };

        if !remote {
            return Ok(LogSource::Local {
                base_dir: local_base_dir,
            });
        }

        let required = |key: &str| {
            request
                .property(key)
                .map(str::to_string)
                .ok_or_else(|| LineageError::Config(format!("{} is required for remote logs", key)))
        };

        let host_key_policy = match request.property(keys::HOST_KEY_POLICY).unwrap_or("permissive") {
            policy if policy.eq_ignore_ascii_case("permissive") => HostKeyPolicy::Permissive,
            policy if policy.eq_ignore_ascii_case("strict") => HostKeyPolicy::Strict {
                known_hosts: PathBuf::from(required(keys::KNOWN_HOSTS)?),
            },
            other => {
                return Err(LineageError::Config(format!(
                    "{} must be permissive or strict, got {:?}",
                    keys::HOST_KEY_POLICY,
                    other
                )))
            }
        };

        let port = match request.property(keys::REMOTE_PORT) {
            Some(port) => parse_numeric(keys::REMOTE_PORT, port)?,
            None => DEFAULT_REMOTE_PORT,
        };
        let timeout_ms = match request.property(keys::REMOTE_TIMEOUT_MS) {
            Some(ms) => parse_numeric(keys::REMOTE_TIMEOUT_MS, ms)?,
            None => DEFAULT_REMOTE_TIMEOUT_MS,
        };

        Ok(LogSource::Remote {
            target: RemoteTarget {
                host: required(keys::REMOTE_HOST)?,
                port,
                user: required(keys::REMOTE_USER)?,
                private_key: PathBuf::from(required(keys::PRIVATE_KEY)?),
                host_key_policy,
                timeout: Duration::from_millis(timeout_ms),
            },
            remote_base_dir: PathBuf::from(request.property(keys::REMOTE_LOG_DIR).unwrap_or(DEFAULT_LOG_DIR)),
            local_base_dir,
        })
    }
}

/// Resolves a request to a readable local log file, fetching it remotely when configured
pub struct LogLocator {
    transport: Arc<dyn RemoteTransport>,
}

impl LogLocator {
    pub fn new(transport: Arc<dyn RemoteTransport>) -> Self {
        Self { transport }
    }

    pub fn with_sftp() -> Self {
        Self::new(Arc::new(SftpTransport))
    }

    pub async fn locate(&self, request: &ExtractionRequest) -> Result<PathBuf, LineageError> {
        let relative = request.record.log_relative_path()?;

        let source = LogSource::from_request(request).map_err(|e| match e {
            LineageError::LogUnavailable(_) => e,
            other => LineageError::LogUnavailable(other.to_string()),
        })?;

        match source {
            LogSource::Local { base_dir } => {
                let path = base_dir.join(&relative);
                tracing::info!("Log file location: {}", path.display());
                Ok(path)
            }
            LogSource::Remote {
                target,
                remote_base_dir,
                local_base_dir,
            } => {
                let remote = remote_base_dir.join(&relative);
                let local = local_base_dir.join(&relative);
                self.fetch_remote(target, remote, local).await
            }
        }
    }

    async fn fetch_remote(
        &self,
        target: RemoteTarget,
        remote: PathBuf,
        local: PathBuf,
    ) -> Result<PathBuf, LineageError> {
        if target.host_key_policy == HostKeyPolicy::Permissive {
            tracing::warn!("Host key checking is disabled for {}", target);
        }

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                tracing::error!("Failed to create log cache directory {}: {}", parent.display(), e);
                LineageError::LogUnavailable(format!(
                    "Cannot create log cache directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let transport = self.transport.clone();
        let task_target = target.clone();
        let task_remote = remote.clone();
        let task_local = local.clone();
        let fetched = tokio::task::spawn_blocking(move || {
            fetch_blocking(transport.as_ref(), &task_target, &task_remote, &task_local)
        })
        .await
        .map_err(|e| LineageError::LogUnavailable(format!("Remote fetch task failed: {}", e)))
        .and_then(|result| result);

        match fetched {
            Ok(bytes) => {
                tracing::info!(
                    "Fetched {} ({} bytes) from {} to {}",
                    remote.display(),
                    bytes,
                    target,
                    local.display()
                );
                Ok(local)
            }
            Err(e) => {
                tracing::error!(
                    host = %target,
                    remote = %remote.display(),
                    local = %local.display(),
                    "Remote log fetch failed: {}",
                    e
                );
                Err(e)
            }
        }
    }
}

/// One guarded session: open, copy, close. A partial local copy is removed on failure.
fn fetch_blocking(
    transport: &dyn RemoteTransport,
    target: &RemoteTarget,
    remote: &Path,
    local: &Path,
) -> Result<u64, LineageError> {
    let mut session = SessionGuard::open(transport, target)?;
    let result = session.fetch(remote, local);
    drop(session);

    if result.is_err() {
        if let Err(e) = std::fs::remove_file(local) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Could not remove partial log {}: {}", local.display(), e);
            }
        }
    }
    result
}
