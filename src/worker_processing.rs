use anyhow::Result;
use lapin::Channel;
use serde_json::{json, Value};
use sqlx::{Pool, Postgres};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;
use crate::database;
use crate::error::{ExecutionError, PollError, SubmissionError};
use crate::messaging;
use crate::models::{JobSpec, PollResult, PollStatus, RemoteJobHandle, SolutionIdentity, TaskMessage};
use crate::runner;
use crate::script;
use crate::slurm::BatchJobClient;

pub struct WorkerEnv {
  pub db: Pool<Postgres>,
  pub channel: Channel,
  pub batch: Arc<BatchJobClient>,
  pub poll_interval: Duration,
  pub max_poll_attempts: u32,
  pub solution_bin: String,
  pub worker_id: String,
}

pub async fn log_message(db_pool: &Pool<Postgres>, worker_node_id: &str, message: &str) -> Result<()> {
  sqlx::query("INSERT INTO logs (worker_node_id, message) VALUES ($1, $2)")
    .bind(worker_node_id)
    .bind(message)
    .execute(db_pool)
    .await?;
  Ok(())
}

pub async fn process_submit_job(env: &WorkerEnv, task_id: Uuid, spec: JobSpec) -> Result<()> {
  database::mark_started(&env.db, task_id).await?;
  log_message(&env.db, &env.worker_id, &format!("Started submit task {}", task_id)).await?;

  match env.batch.submit(task_id, &spec).await {
    Ok(handle) => {
      database::record_remote_job(&env.db, task_id, &handle.job_id).await?;
      let message = TaskMessage::PollJob {
        task_id,
        job_name: script::job_name(&spec.identity),
        handle,
        attempts: 0,
      };
      messaging::publish_delayed(&env.channel, &serde_json::to_vec(&message)?, env.poll_interval).await?;
      log_message(&env.db, &env.worker_id, &format!("Submit task {} handed to scheduler", task_id)).await?;
    }
    Err(e) => {
      error!("Submission failed for task {}: {:?}", task_id, e);
      database::mark_failure(&env.db, task_id, submission_failure(&e)).await?;
      log_message(&env.db, &env.worker_id, &format!("Submit task {} failed: {}", task_id, e)).await?;
    }
  }
  Ok(())
}

pub async fn process_poll_job(
  env: &WorkerEnv,
  task_id: Uuid,
  handle: RemoteJobHandle,
  job_name: String,
  attempts: u32,
) -> Result<()> {
  database::mark_started(&env.db, task_id).await?;

  let outcome = env.batch.query_status(&handle).await;
  if let Err(e) = &outcome {
    error!("Status query failed for task {}: {}", task_id, e);
  }

  match next_poll_action(outcome, attempts, env.max_poll_attempts) {
    PollAction::Complete { raw } => {
      let output_file = script::output_file_name(&job_name, &handle.job_id);
      let result = json!({
        "remote_job_id": handle.job_id.clone(),
        "output_file": output_file,
        "raw": raw,
      });
      if database::mark_success(&env.db, task_id, result).await? {
        info!("Remote job {} completed, task {} succeeded", handle.job_id, task_id);
        log_message(&env.db, &env.worker_id, &format!("Task {} succeeded (remote job {})", task_id, handle.job_id)).await?;
      }
    }
    PollAction::Reschedule { attempts } => {
      let message = TaskMessage::PollJob { task_id, handle, job_name, attempts };
      messaging::publish_delayed(&env.channel, &serde_json::to_vec(&message)?, env.poll_interval).await?;
    }
    PollAction::TimedOut { attempts } => {
      let message = format!(
        "remote job {} did not reach a terminal state within {} poll attempts",
        handle.job_id, attempts
      );
      let cause = json!({
        "kind": "timeout",
        "message": message,
        "remote_job_id": handle.job_id,
        "attempts": attempts,
      });
      database::mark_failure(&env.db, task_id, cause).await?;
      log_message(&env.db, &env.worker_id, &format!("Task {} timed out after {} poll attempts", task_id, attempts)).await?;
    }
  }
  Ok(())
}

pub async fn process_local_run(
  env: &WorkerEnv,
  task_id: Uuid,
  identity: SolutionIdentity,
  arguments: BTreeMap<String, String>,
) -> Result<()> {
  database::mark_started(&env.db, task_id).await?;
  log_message(&env.db, &env.worker_id, &format!("Started local run task {}", task_id)).await?;

  match runner::run_solution(&env.solution_bin, &identity, &arguments).await {
    Ok(outcome) => {
      let result = json!({
        "output": outcome.output,
        "result": { "exit_status": outcome.exit_status },
      });
      database::mark_success(&env.db, task_id, result).await?;
      log_message(&env.db, &env.worker_id, &format!("Local run task {} completed", task_id)).await?;
    }
    Err(e) => {
      error!(
        "Local run of {} failed for task {}: {} (arguments: {:?})",
        identity.coordinate(), task_id, e, arguments
      );
      database::mark_failure(&env.db, task_id, execution_failure(&e)).await?;
      log_message(&env.db, &env.worker_id, &format!("Local run task {} failed: {}", task_id, e)).await?;
    }
  }
  Ok(())
}

#[derive(Debug, PartialEq, Eq)]
pub enum PollAction {
  Complete { raw: String },
  Reschedule { attempts: u32 },
  TimedOut { attempts: u32 },
}

// A transient query error reschedules on the same fixed delay; it is never
// read as completion. Both outcomes count toward the attempt cap so a dead
// host cannot keep a chain alive forever.
pub fn next_poll_action(
  outcome: Result<PollResult, PollError>,
  attempts: u32,
  max_attempts: u32,
) -> PollAction {
  match outcome {
    Ok(PollResult { status: PollStatus::Completed, raw }) => PollAction::Complete { raw },
    Ok(PollResult { status: PollStatus::Running, .. }) | Err(_) => {
      let attempts = attempts + 1;
      if attempts >= max_attempts {
        PollAction::TimedOut { attempts }
      } else {
        PollAction::Reschedule { attempts }
      }
    }
  }
}

fn submission_failure(error: &SubmissionError) -> Value {
  json!({
    "kind": error.kind(),
    "message": error.to_string(),
    "raw": error.raw_output(),
  })
}

fn execution_failure(error: &ExecutionError) -> Value {
  json!({
    "kind": error.kind(),
    "message": error.to_string(),
    "output": error.output(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::TransportError;

  fn running() -> Result<PollResult, PollError> {
    Ok(PollResult { status: PollStatus::Running, raw: "4242 gpu job R".into() })
  }

  fn completed() -> Result<PollResult, PollError> {
    Ok(PollResult { status: PollStatus::Completed, raw: String::new() })
  }

  fn transient() -> Result<PollResult, PollError> {
    Err(PollError::Transport(TransportError::Io {
      host: "h1".into(),
      message: "connection reset".into(),
    }))
  }

  #[test]
  fn chain_completes_exactly_once_after_n_plus_one_polls() {
    let max = 10;
    let mut attempts = 0;
    let mut actions = Vec::new();
    for outcome in [running(), running(), running(), completed()] {
      let action = next_poll_action(outcome, attempts, max);
      if let PollAction::Reschedule { attempts: next } = &action {
        attempts = *next;
      }
      actions.push(action);
    }

    assert_eq!(actions.len(), 4);
    assert!(matches!(actions[0], PollAction::Reschedule { attempts: 1 }));
    assert!(matches!(actions[1], PollAction::Reschedule { attempts: 2 }));
    assert!(matches!(actions[2], PollAction::Reschedule { attempts: 3 }));
    assert!(matches!(actions[3], PollAction::Complete { .. }));
    assert!(!actions.iter().any(|a| matches!(a, PollAction::TimedOut { .. })));
  }

  #[test]
  fn transient_error_reschedules_instead_of_completing() {
    let action = next_poll_action(transient(), 0, 10);
    assert_eq!(action, PollAction::Reschedule { attempts: 1 });
  }

  #[test]
  fn attempt_cap_turns_into_timeout_failure() {
    assert_eq!(next_poll_action(running(), 9, 10), PollAction::TimedOut { attempts: 10 });
    assert_eq!(next_poll_action(transient(), 9, 10), PollAction::TimedOut { attempts: 10 });
  }

  #[test]
  fn completion_wins_even_on_the_last_attempt() {
    assert!(matches!(next_poll_action(completed(), 9, 10), PollAction::Complete { .. }));
  }

  #[test]
  fn submission_failure_carries_raw_output() {
    let cause = submission_failure(&SubmissionError::SubmitFailed {
      exit_status: 1,
      raw: "sbatch: error\n".into(),
    });
    assert_eq!(cause["kind"], "submit_failed");
    assert_eq!(cause["raw"], "sbatch: error\n");
  }

  #[test]
  fn execution_failure_carries_captured_output() {
    let cause = execution_failure(&ExecutionError::Failed {
      exit_status: 2,
      output: "Traceback: boom\n".into(),
    });
    assert_eq!(cause["kind"], "execution_failed");
    assert_eq!(cause["output"], "Traceback: boom\n");
  }
}
