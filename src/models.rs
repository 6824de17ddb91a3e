use serde::{Serialize, Deserialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
  Pending,
  Started,
  Success,
  Failure,
}

impl TaskState {
  pub fn as_str(&self) -> &'static str {
    match self {
      TaskState::Pending => "pending",
      TaskState::Started => "started",
      TaskState::Success => "success",
      TaskState::Failure => "failure",
    }
  }

  pub fn parse(value: &str) -> Option<TaskState> {
    match value {
      "pending" => Some(TaskState::Pending),
      "started" => Some(TaskState::Started),
      "success" => Some(TaskState::Success),
      "failure" => Some(TaskState::Failure),
      _ => None,
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, TaskState::Success | TaskState::Failure)
  }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct Task {
  pub id: Uuid,
  pub task_type: String,
  pub payload: serde_json::Value,
  pub status: String,
  pub result: Option<serde_json::Value>,
  pub attempts: i32,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolutionIdentity {
  pub catalog: String,
  pub group: String,
  pub name: String,
  pub version: String,
}

impl SolutionIdentity {
  pub fn coordinate(&self) -> String {
    format!("{}:{}:{}:{}", self.catalog, self.group, self.name, self.version)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
  pub cpus: u32,
  pub memory: String,
  pub gpus: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
  pub identity: SolutionIdentity,
  pub resources: Resources,
  pub arguments: BTreeMap<String, String>,
  pub target_host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteJobHandle {
  pub job_id: String,
  pub host: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollStatus {
  Running,
  Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResult {
  pub status: PollStatus,
  pub raw: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task_type", rename_all = "snake_case")]
pub enum TaskMessage {
  SubmitJob {
    task_id: Uuid,
    spec: JobSpec,
  },
  PollJob {
    task_id: Uuid,
    handle: RemoteJobHandle,
    job_name: String,
    attempts: u32,
  },
  LocalRun {
    task_id: Uuid,
    identity: SolutionIdentity,
    arguments: BTreeMap<String, String>,
  },
}

impl TaskMessage {
  pub fn task_id(&self) -> Uuid {
    match self {
      TaskMessage::SubmitJob { task_id, .. } => *task_id,
      TaskMessage::PollJob { task_id, .. } => *task_id,
      TaskMessage::LocalRun { task_id, .. } => *task_id,
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      TaskMessage::SubmitJob { .. } => "submit_job",
      TaskMessage::PollJob { .. } => "poll_job",
      TaskMessage::LocalRun { .. } => "local_run",
    }
  }

  // Status polls go ahead of fresh submissions so a deep submit backlog
  // cannot starve running jobs of their state transitions.
  pub fn priority(&self) -> u8 {
    match self {
      TaskMessage::PollJob { .. } => 1,
      TaskMessage::SubmitJob { .. } => 5,
      TaskMessage::LocalRun { .. } => 7,
    }
  }
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct JobSubmission {
  pub id: Uuid,
  pub task_id: Uuid,
  pub solution: String,
  pub arguments: serde_json::Value,
  pub target_host: String,
  pub submitted_at: DateTime<Utc>,
  pub remote_job_id: Option<String>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn task_state_round_trips_through_storage_text() {
    for state in [TaskState::Pending, TaskState::Started, TaskState::Success, TaskState::Failure] {
      assert_eq!(TaskState::parse(state.as_str()), Some(state));
    }
    assert_eq!(TaskState::parse("running"), None);
  }

  #[test]
  fn terminal_states_are_success_and_failure_only() {
    assert!(!TaskState::Pending.is_terminal());
    assert!(!TaskState::Started.is_terminal());
    assert!(TaskState::Success.is_terminal());
    assert!(TaskState::Failure.is_terminal());
  }

  #[test]
  fn task_message_tag_matches_task_type_column() {
    let message = TaskMessage::PollJob {
      task_id: Uuid::new_v4(),
      handle: RemoteJobHandle { job_id: "123".into(), host: "h1".into() },
      job_name: "cat_grp_sol_1.0".into(),
      attempts: 2,
    };
    let value = serde_json::to_value(&message).unwrap();
    assert_eq!(value.get("task_type").and_then(|v| v.as_str()), Some(message.kind()));

    let restored: TaskMessage = serde_json::from_value(value).unwrap();
    match restored {
      TaskMessage::PollJob { attempts, handle, .. } => {
        assert_eq!(attempts, 2);
        assert_eq!(handle.job_id, "123");
      }
      other => panic!("Unexpected message variant: {:?}", other),
    }
  }

  #[test]
  fn poll_messages_outrank_submissions() {
    let poll = TaskMessage::PollJob {
      task_id: Uuid::new_v4(),
      handle: RemoteJobHandle { job_id: "1".into(), host: "h1".into() },
      job_name: "j".into(),
      attempts: 0,
    };
    let submit = TaskMessage::SubmitJob {
      task_id: Uuid::new_v4(),
      spec: JobSpec {
        identity: SolutionIdentity {
          catalog: "c".into(),
          group: "g".into(),
          name: "n".into(),
          version: "1.0".into(),
        },
        resources: Resources { cpus: 1, memory: "4G".into(), gpus: 0 },
        arguments: BTreeMap::new(),
        target_host: "h1".into(),
      },
    };
    assert!(poll.priority() < submit.priority());
  }
}
