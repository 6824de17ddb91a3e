use regex::Regex;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use crate::error::{PollError, SubmissionError};
use crate::models::{JobSpec, PollResult, PollStatus, RemoteJobHandle};
use crate::remote::RemoteExec;
use crate::script;

pub struct BatchJobClient {
  exec: Arc<dyn RemoteExec>,
}

impl BatchJobClient {
  pub fn new(exec: Arc<dyn RemoteExec>) -> Self {
    Self { exec }
  }

  // Path is unique per submission so concurrent submits against one host
  // cannot interleave script content.
  pub fn remote_script_path(task_id: Uuid) -> String {
    format!("/tmp/bjqs_job_{task_id}.sh")
  }

  pub async fn submit(&self, task_id: Uuid, spec: &JobSpec) -> Result<RemoteJobHandle, SubmissionError> {
    let script_text = script::build_script(spec);
    let path = Self::remote_script_path(task_id);
    let host = spec.target_host.as_str();

    if let Err(e) = self.exec.copy(host, &path, &script_text).await {
      self.remove_script(host, &path).await;
      return Err(SubmissionError::Upload(e));
    }

    let submitted = self.exec.execute(host, &format!("sbatch {path}")).await;
    self.remove_script(host, &path).await;

    let output = submitted.map_err(SubmissionError::Transport)?;
    if output.exit_status != 0 {
      return Err(SubmissionError::SubmitFailed {
        exit_status: output.exit_status,
        raw: format!("{}{}", output.stdout, output.stderr),
      });
    }

    let raw = output.stdout.trim();
    if raw.is_empty() {
      return Err(SubmissionError::EmptyOutput);
    }
    let job_id = raw.split_whitespace().last().unwrap_or_default();
    let plausible = Regex::new(r"^[0-9]+$").unwrap();
    if !plausible.is_match(job_id) {
      return Err(SubmissionError::UnparsableJobId { raw: raw.to_string() });
    }

    info!("Task {} submitted to {} as remote job {}", task_id, host, job_id);
    Ok(RemoteJobHandle {
      job_id: job_id.to_string(),
      host: spec.target_host.clone(),
    })
  }

  // Empty queue listing means the scheduler no longer tracks the job; a
  // failing query is transient and never reported as completion.
  pub async fn query_status(&self, handle: &RemoteJobHandle) -> Result<PollResult, PollError> {
    let output = self.exec
      .execute(&handle.host, &format!("squeue -j {} -h", handle.job_id))
      .await?;
    if output.exit_status != 0 {
      return Err(PollError::QueryFailed {
        exit_status: output.exit_status,
        raw: format!("{}{}", output.stdout, output.stderr),
      });
    }
    let status = if output.stdout.trim().is_empty() {
      PollStatus::Completed
    } else {
      PollStatus::Running
    };
    Ok(PollResult { status, raw: output.stdout })
  }

  pub async fn fetch_output(&self, host: &str, output_file: &str) -> Result<String, PollError> {
    let output = self.exec
      .execute(host, &format!("cat {}", output_file))
      .await?;
    if output.exit_status != 0 {
      return Err(PollError::QueryFailed {
        exit_status: output.exit_status,
        raw: format!("{}{}", output.stdout, output.stderr),
      });
    }
    Ok(output.stdout)
  }

  async fn remove_script(&self, host: &str, path: &str) {
    if let Err(e) = self.exec.execute(host, &format!("rm -f {path}")).await {
      warn!("Failed to remove remote script {} on {}: {}", path, host, e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use std::collections::{BTreeMap, VecDeque};
  use std::sync::Mutex;
  use crate::error::TransportError;
  use crate::models::{Resources, SolutionIdentity};
  use crate::remote::ExecOutput;

  struct StubExec {
    responses: Mutex<VecDeque<Result<ExecOutput, TransportError>>>,
    commands: Mutex<Vec<String>>,
    copies: Mutex<Vec<(String, String)>>,
    fail_copy: bool,
  }

  impl StubExec {
    fn new(responses: Vec<Result<ExecOutput, TransportError>>) -> Self {
      Self {
        responses: Mutex::new(responses.into()),
        commands: Mutex::new(Vec::new()),
        copies: Mutex::new(Vec::new()),
        fail_copy: false,
      }
    }

    fn failing_copy() -> Self {
      let mut stub = Self::new(Vec::new());
      stub.fail_copy = true;
      stub
    }

    fn ok(stdout: &str) -> Result<ExecOutput, TransportError> {
      Ok(ExecOutput { stdout: stdout.into(), stderr: String::new(), exit_status: 0 })
    }

    fn exit(status: i32, stderr: &str) -> Result<ExecOutput, TransportError> {
      Ok(ExecOutput { stdout: String::new(), stderr: stderr.into(), exit_status: status })
    }

    fn transport() -> Result<ExecOutput, TransportError> {
      Err(TransportError::Io { host: "h1".into(), message: "broken pipe".into() })
    }

    fn commands(&self) -> Vec<String> {
      self.commands.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl RemoteExec for StubExec {
    async fn execute(&self, _host: &str, command: &str) -> Result<ExecOutput, TransportError> {
      self.commands.lock().unwrap().push(command.to_string());
      self.responses.lock().unwrap().pop_front().unwrap_or_else(|| StubExec::ok(""))
    }

    async fn copy(&self, _host: &str, remote_path: &str, content: &str) -> Result<(), TransportError> {
      if self.fail_copy {
        return Err(TransportError::Connect { host: "h1".into(), message: "unreachable".into() });
      }
      self.copies.lock().unwrap().push((remote_path.to_string(), content.to_string()));
      Ok(())
    }
  }

  fn spec() -> JobSpec {
    JobSpec {
      identity: SolutionIdentity {
        catalog: "copick".into(),
        group: "seg".into(),
        name: "membrain".into(),
        version: "1.0".into(),
      },
      resources: Resources { cpus: 2, memory: "16G".into(), gpus: 0 },
      arguments: BTreeMap::new(),
      target_host: "h1".into(),
    }
  }

  fn make_client(stub: StubExec) -> (BatchJobClient, Arc<StubExec>) {
    let stub = Arc::new(stub);
    (BatchJobClient::new(stub.clone()), stub)
  }

  #[tokio::test]
  async fn submit_parses_trailing_job_id() {
    let task_id = Uuid::new_v4();
    let (client, stub) = make_client(StubExec::new(vec![
      StubExec::ok("Submitted batch job 4242\n"),
      StubExec::ok(""),
    ]));

    let handle = client.submit(task_id, &spec()).await.unwrap();
    assert_eq!(handle.job_id, "4242");
    assert_eq!(handle.host, "h1");

    let copies = stub.copies.lock().unwrap().clone();
    assert_eq!(copies.len(), 1);
    assert!(copies[0].0.contains(&task_id.to_string()));
    assert!(copies[0].1.starts_with("#!/bin/bash\n"));

    let commands = stub.commands();
    assert!(commands[0].starts_with("sbatch /tmp/bjqs_job_"));
    assert_eq!(commands[1], format!("rm -f {}", copies[0].0));
  }

  #[tokio::test]
  async fn submit_nonzero_exit_yields_submission_error_and_cleans_up() {
    let (client, stub) = make_client(StubExec::new(vec![
      StubExec::exit(1, "sbatch: error: invalid partition\n"),
      StubExec::ok(""),
    ]));

    let err = client.submit(Uuid::new_v4(), &spec()).await.unwrap_err();
    match err {
      SubmissionError::SubmitFailed { exit_status, raw } => {
        assert_eq!(exit_status, 1);
        assert!(raw.contains("invalid partition"));
      }
      other => panic!("Unexpected error: {:?}", other),
    }
    assert!(stub.commands().iter().any(|c| c.starts_with("rm -f ")));
  }

  #[tokio::test]
  async fn submit_empty_output_is_a_hard_failure() {
    let (client, _stub) = make_client(StubExec::new(vec![
      StubExec::ok("   \n"),
      StubExec::ok(""),
    ]));
    let err = client.submit(Uuid::new_v4(), &spec()).await.unwrap_err();
    assert!(matches!(err, SubmissionError::EmptyOutput));
  }

  #[tokio::test]
  async fn submit_rejects_implausible_job_id() {
    let (client, _stub) = make_client(StubExec::new(vec![
      StubExec::ok("sbatch: queue is full, try later\n"),
      StubExec::ok(""),
    ]));
    let err = client.submit(Uuid::new_v4(), &spec()).await.unwrap_err();
    assert!(matches!(err, SubmissionError::UnparsableJobId { .. }));
  }

  #[tokio::test]
  async fn submit_upload_failure_never_yields_a_handle() {
    let (client, _stub) = make_client(StubExec::failing_copy());
    let err = client.submit(Uuid::new_v4(), &spec()).await.unwrap_err();
    assert!(matches!(err, SubmissionError::Upload(_)));
  }

  #[tokio::test]
  async fn remote_script_paths_are_unique_per_task() {
    let a = BatchJobClient::remote_script_path(Uuid::new_v4());
    let b = BatchJobClient::remote_script_path(Uuid::new_v4());
    assert_ne!(a, b);
  }

  #[tokio::test]
  async fn query_distinguishes_running_completed_and_transient_errors() {
    let handle = RemoteJobHandle { job_id: "4242".into(), host: "h1".into() };

    let (client, stub) = make_client(StubExec::new(vec![
      StubExec::ok("4242 gpu copick_s user R 1:02 1 node01\n"),
    ]));
    let result = client.query_status(&handle).await.unwrap();
    assert_eq!(result.status, PollStatus::Running);
    assert!(stub.commands()[0].contains("squeue -j 4242"));

    let (client, _stub) = make_client(StubExec::new(vec![StubExec::ok("")]));
    let result = client.query_status(&handle).await.unwrap();
    assert_eq!(result.status, PollStatus::Completed);

    let (client, _stub) = make_client(StubExec::new(vec![StubExec::exit(1, "slurm_load_jobs error\n")]));
    assert!(matches!(client.query_status(&handle).await.unwrap_err(), PollError::QueryFailed { .. }));

    let (client, _stub) = make_client(StubExec::new(vec![StubExec::transport()]));
    assert!(matches!(client.query_status(&handle).await.unwrap_err(), PollError::Transport(_)));
  }

  #[tokio::test]
  async fn fetch_output_cats_the_declared_output_file() {
    let (client, stub) = make_client(StubExec::new(vec![StubExec::ok("picking done\n")]));
    let output = client.fetch_output("h1", "copick_seg_membrain_1.0_4242.out").await.unwrap();
    assert_eq!(output, "picking done\n");
    assert_eq!(stub.commands()[0], "cat copick_seg_membrain_1.0_4242.out");
  }
}
