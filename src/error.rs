use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
  #[error("failed to connect to {host}: {message}")]
  Connect { host: String, message: String },
  #[error("authentication failed for {user}@{host}: {message}")]
  Auth { host: String, user: String, message: String },
  #[error("remote i/o failure on {host}: {message}")]
  Io { host: String, message: String },
}

#[derive(Debug, Error)]
pub enum SubmissionError {
  #[error("failed to upload job script: {0}")]
  Upload(TransportError),
  #[error("submit command transport failure: {0}")]
  Transport(TransportError),
  #[error("submit command exited with status {exit_status}")]
  SubmitFailed { exit_status: i32, raw: String },
  #[error("submit command produced no output")]
  EmptyOutput,
  #[error("could not parse a job id from submit output")]
  UnparsableJobId { raw: String },
}

impl SubmissionError {
  pub fn kind(&self) -> &'static str {
    match self {
      SubmissionError::Upload(_) => "upload_failed",
      SubmissionError::Transport(_) => "transport_failed",
      SubmissionError::SubmitFailed { .. } => "submit_failed",
      SubmissionError::EmptyOutput => "empty_output",
      SubmissionError::UnparsableJobId { .. } => "unparsable_job_id",
    }
  }

  pub fn raw_output(&self) -> Option<&str> {
    match self {
      SubmissionError::SubmitFailed { raw, .. } => Some(raw),
      SubmissionError::UnparsableJobId { raw } => Some(raw),
      _ => None,
    }
  }
}

#[derive(Debug, Error)]
pub enum PollError {
  #[error("status query transport failure: {0}")]
  Transport(#[from] TransportError),
  #[error("status query exited with status {exit_status}")]
  QueryFailed { exit_status: i32, raw: String },
}

#[derive(Debug, Error)]
pub enum ExecutionError {
  #[error("failed to spawn {bin}: {message}")]
  Spawn { bin: String, message: String },
  #[error("solution exited with status {exit_status}")]
  Failed { exit_status: i32, output: String },
}

impl ExecutionError {
  pub fn kind(&self) -> &'static str {
    match self {
      ExecutionError::Spawn { .. } => "spawn_failed",
      ExecutionError::Failed { .. } => "execution_failed",
    }
  }

  pub fn output(&self) -> Option<&str> {
    match self {
      ExecutionError::Failed { output, .. } => Some(output),
      _ => None,
    }
  }
}
