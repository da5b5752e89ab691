// Remote transport used to pull execution logs from the workflow engine host
use ssh2::{CheckResult, KnownHostFileKind, Session};
use std::fmt;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::LineageError;

/// How the remote host key is verified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept any host key
    Permissive,
    /// Require a matching entry in an OpenSSH known-hosts file
    Strict { known_hosts: PathBuf },
}

/// Connection parameters of one remote fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub private_key: PathBuf,
    pub host_key_policy: HostKeyPolicy,
    pub timeout: Duration,
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Opens authenticated sessions to a remote host.
/// Implementations block; callers run them off the async executor.
pub trait RemoteTransport: Send + Sync {
    fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn TransportSession>, LineageError>;
}

pub trait TransportSession: Send {
    /// Copy one remote file to a local path, returning the bytes copied
    fn fetch(&mut self, remote: &Path, local: &Path) -> Result<u64, LineageError>;

    fn close(&mut self);
}

/// Closes the wrapped session when dropped, whatever the exit path
pub struct SessionGuard {
    session: Box<dyn TransportSession>,
}

impl SessionGuard {
    pub fn open(transport: &dyn RemoteTransport, target: &RemoteTarget) -> Result<Self, LineageError> {
        let session = transport.connect(target)?;
        Ok(Self { session })
    }

    pub fn fetch(&mut self, remote: &Path, local: &Path) -> Result<u64, LineageError> {
        self.session.fetch(remote, local)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.close();
    }
}

/// SFTP over libssh2 with private-key authentication
#[derive(Debug, Default, Clone, Copy)]
pub struct SftpTransport;

fn unavailable(target: &RemoteTarget, what: &str, err: impl fmt::Display) -> LineageError {
    LineageError::LogUnavailable(format!("{} failed for {}: {}", what, target, err))
}

impl SftpTransport {
    fn verify_host_key(session: &Session, target: &RemoteTarget) -> Result<(), LineageError> {
        let known_hosts_file = match &target.host_key_policy {
            HostKeyPolicy::Permissive => return Ok(()),
            HostKeyPolicy::Strict { known_hosts } => known_hosts,
        };

        let mut known_hosts = session
            .known_hosts()
            .map_err(|e| unavailable(target, "Host key verification", e))?;
        known_hosts
            .read_file(known_hosts_file, KnownHostFileKind::OpenSSH)
            .map_err(|e| unavailable(target, "Reading known hosts", e))?;

        let (key, _) = session
            .host_key()
            .ok_or_else(|| unavailable(target, "Host key verification", "no host key offered"))?;

        match known_hosts.check_port(&target.host, target.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::Mismatch => Err(unavailable(target, "Host key verification", "host key mismatch")),
            CheckResult::NotFound => Err(unavailable(target, "Host key verification", "host not in known hosts")),
            CheckResult::Failure => Err(unavailable(target, "Host key verification", "check failed")),
        }
    }
}

impl RemoteTransport for SftpTransport {
    fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn TransportSession>, LineageError> {
        let addr = (target.host.as_str(), target.port)
            .to_socket_addrs()
            .map_err(|e| unavailable(target, "Address resolution", e))?
            .next()
            .ok_or_else(|| unavailable(target, "Address resolution", "no address found"))?;

        let tcp = TcpStream::connect_timeout(&addr, target.timeout)
            .map_err(|e| unavailable(target, "TCP connect", e))?;

        let mut session = Session::new().map_err(|e| unavailable(target, "SSH session setup", e))?;
        session.set_timeout(target.timeout.as_millis().min(u32::MAX as u128) as u32);
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| unavailable(target, "SSH handshake", e))?;

        Self::verify_host_key(&session, target)?;

        session
            .userauth_pubkey_file(&target.user, None, &target.private_key, None)
            .map_err(|e| unavailable(target, "Public key authentication", e))?;
        if !session.authenticated() {
            return Err(unavailable(target, "Public key authentication", "rejected"));
        }

        tracing::debug!("SFTP session opened to {}", target);
        Ok(Box::new(SftpSession {
            session,
            target: target.to_string(),
            closed: false,
        }))
    }
}

struct SftpSession {
    session: Session,
    target: String,
    closed: bool,
}

impl TransportSession for SftpSession {
    fn fetch(&mut self, remote: &Path, local: &Path) -> Result<u64, LineageError> {
        let fail = |what: &str, err: &dyn fmt::Display| {
            LineageError::LogUnavailable(format!(
                "{} failed for {}:{}: {}",
                what,
                self.target,
                remote.display(),
                err
            ))
        };

        let sftp = self.session.sftp().map_err(|e| fail("SFTP channel", &e))?;
        let mut remote_file = sftp.open(remote).map_err(|e| fail("Opening remote log", &e))?;
        let mut local_file =
            std::fs::File::create(local).map_err(|e| fail("Creating local log", &e))?;

        let copied: io::Result<u64> = io::copy(&mut remote_file, &mut local_file);
        copied.map_err(|e| fail("Copying remote log", &e))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.session.disconnect(None, "finished", None) {
            tracing::debug!("SSH disconnect from {} reported: {}", self.target, e);
        }
        tracing::debug!("SFTP session closed to {}", self.target);
    }
}
