use async_trait::async_trait;
use ssh2::Session;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_retry::Retry;
use tokio_retry::strategy::FixedInterval;
use tracing::debug;
use crate::error::TransportError;

// Transport failures are retried exactly once before being surfaced.
static TRANSPORT_RETRIES: usize = 1;
static RETRY_DELAY_MS: u64 = 500;
static CONNECT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
  pub stdout: String,
  pub stderr: String,
  pub exit_status: i32,
}

#[async_trait]
pub trait RemoteExec: Send + Sync {
  async fn execute(&self, host: &str, command: &str) -> Result<ExecOutput, TransportError>;
  async fn copy(&self, host: &str, remote_path: &str, content: &str) -> Result<(), TransportError>;
}

// Key-based auth only. Holds no per-call state, so one executor is shared
// across all concurrent tasks.
#[derive(Debug, Clone)]
pub struct SshExecutor {
  user: String,
  key_path: Option<PathBuf>,
  connect_timeout: Duration,
}

impl SshExecutor {
  pub fn new(user: String, key_path: Option<PathBuf>) -> Self {
    Self {
      user,
      key_path,
      connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
    }
  }

  fn open_session(&self, host: &str) -> Result<Session, TransportError> {
    let addr = host_addr(host);
    let socket_addr = addr
      .to_socket_addrs()
      .map_err(|e| TransportError::Connect { host: host.into(), message: e.to_string() })?
      .next()
      .ok_or_else(|| TransportError::Connect {
        host: host.into(),
        message: "no address resolved".into(),
      })?;
    let tcp = TcpStream::connect_timeout(&socket_addr, self.connect_timeout)
      .map_err(|e| TransportError::Connect { host: host.into(), message: e.to_string() })?;

    let mut session = Session::new()
      .map_err(|e| TransportError::Io { host: host.into(), message: e.to_string() })?;
    session.set_tcp_stream(tcp);
    session.handshake()
      .map_err(|e| TransportError::Connect { host: host.into(), message: e.to_string() })?;

    let auth = match &self.key_path {
      Some(path) => session.userauth_pubkey_file(&self.user, None, path, None),
      None => session.userauth_agent(&self.user),
    };
    auth.map_err(|e| TransportError::Auth {
      host: host.into(),
      user: self.user.clone(),
      message: e.to_string(),
    })?;
    if !session.authenticated() {
      return Err(TransportError::Auth {
        host: host.into(),
        user: self.user.clone(),
        message: "authentication rejected".into(),
      });
    }
    Ok(session)
  }

  fn exec_blocking(&self, host: &str, command: &str) -> Result<ExecOutput, TransportError> {
    let io_err = |e: ssh2::Error| TransportError::Io { host: host.into(), message: e.to_string() };
    let read_err = |e: std::io::Error| TransportError::Io { host: host.into(), message: e.to_string() };

    let session = self.open_session(host)?;
    let mut channel = session.channel_session().map_err(io_err)?;
    channel.exec(command).map_err(io_err)?;

    let mut stdout = String::new();
    channel.read_to_string(&mut stdout).map_err(read_err)?;
    let mut stderr = String::new();
    channel.stderr().read_to_string(&mut stderr).map_err(read_err)?;
    channel.wait_close().map_err(io_err)?;
    let exit_status = channel.exit_status().map_err(io_err)?;

    debug!("Remote command on {} exited with status {}", host, exit_status);
    Ok(ExecOutput { stdout, stderr, exit_status })
  }

  fn copy_blocking(&self, host: &str, remote_path: &str, content: &str) -> Result<(), TransportError> {
    let io_err = |e: ssh2::Error| TransportError::Io { host: host.into(), message: e.to_string() };
    let write_err = |e: std::io::Error| TransportError::Io { host: host.into(), message: e.to_string() };

    let session = self.open_session(host)?;
    let mut remote = session
      .scp_send(Path::new(remote_path), 0o644, content.len() as u64, None)
      .map_err(io_err)?;
    remote.write_all(content.as_bytes()).map_err(write_err)?;
    remote.send_eof().map_err(io_err)?;
    remote.wait_eof().map_err(io_err)?;
    remote.close().map_err(io_err)?;
    remote.wait_close().map_err(io_err)?;
    Ok(())
  }
}

#[async_trait]
impl RemoteExec for SshExecutor {
  async fn execute(&self, host: &str, command: &str) -> Result<ExecOutput, TransportError> {
    Retry::spawn(FixedInterval::from_millis(RETRY_DELAY_MS).take(TRANSPORT_RETRIES), || {
      let executor = self.clone();
      let host = host.to_string();
      let command = command.to_string();
      async move {
        let join_host = host.clone();
        match tokio::task::spawn_blocking(move || executor.exec_blocking(&host, &command)).await {
          Ok(result) => result,
          Err(e) => Err(TransportError::Io { host: join_host, message: e.to_string() }),
        }
      }
    })
      .await
  }

  async fn copy(&self, host: &str, remote_path: &str, content: &str) -> Result<(), TransportError> {
    Retry::spawn(FixedInterval::from_millis(RETRY_DELAY_MS).take(TRANSPORT_RETRIES), || {
      let executor = self.clone();
      let host = host.to_string();
      let remote_path = remote_path.to_string();
      let content = content.to_string();
      async move {
        let join_host = host.clone();
        match tokio::task::spawn_blocking(move || executor.copy_blocking(&host, &remote_path, &content)).await {
          Ok(result) => result,
          Err(e) => Err(TransportError::Io { host: join_host, message: e.to_string() }),
        }
      }
    })
      .await
  }
}

fn host_addr(host: &str) -> String {
  if host.contains(':') {
    host.to_string()
  } else {
    format!("{host}:22")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn host_addr_defaults_to_ssh_port() {
    assert_eq!(host_addr("cluster01"), "cluster01:22");
    assert_eq!(host_addr("cluster01:2222"), "cluster01:2222");
  }
}
