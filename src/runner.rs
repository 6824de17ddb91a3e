use std::collections::BTreeMap;
use tokio::process::Command;
use tracing::info;
use crate::error::ExecutionError;
use crate::models::SolutionIdentity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRunOutcome {
  pub output: String,
  pub exit_status: i32,
}

// Runs the solution on the worker host itself, no scheduler involved.
// Stdout and stderr are captured verbatim for the caller to retrieve.
pub async fn run_solution(
  bin: &str,
  identity: &SolutionIdentity,
  arguments: &BTreeMap<String, String>,
) -> Result<LocalRunOutcome, ExecutionError> {
  let coordinate = identity.coordinate();
  info!("Running solution {} locally", coordinate);

  let mut command = Command::new(bin);
  command.arg("run").arg(&coordinate);
  for (name, value) in arguments {
    command.arg(format!("--{name}")).arg(value);
  }

  let output = command.output().await.map_err(|e| ExecutionError::Spawn {
    bin: bin.to_string(),
    message: e.to_string(),
  })?;

  let mut captured = String::from_utf8_lossy(&output.stdout).into_owned();
  captured.push_str(&String::from_utf8_lossy(&output.stderr));
  let exit_status = output.status.code().unwrap_or(-1);

  if !output.status.success() {
    return Err(ExecutionError::Failed { exit_status, output: captured });
  }
  Ok(LocalRunOutcome { output: captured, exit_status })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn identity() -> SolutionIdentity {
    SolutionIdentity {
      catalog: "copick".into(),
      group: "seg".into(),
      name: "membrain".into(),
      version: "1.0".into(),
    }
  }

  #[tokio::test]
  async fn captures_console_output() {
    let mut arguments = BTreeMap::new();
    arguments.insert("threshold".to_string(), "0.5".to_string());

    let outcome = run_solution("echo", &identity(), &arguments).await.unwrap();
    assert_eq!(outcome.exit_status, 0);
    assert_eq!(outcome.output, "run copick:seg:membrain:1.0 --threshold 0.5\n");
  }

  #[tokio::test]
  async fn nonzero_exit_surfaces_as_execution_error() {
    let err = run_solution("false", &identity(), &BTreeMap::new()).await.unwrap_err();
    match err {
      ExecutionError::Failed { exit_status, .. } => assert_eq!(exit_status, 1),
      other => panic!("Unexpected error: {:?}", other),
    }
  }

  #[tokio::test]
  async fn missing_binary_surfaces_as_spawn_error() {
    let err = run_solution("/nonexistent/solution-runner", &identity(), &BTreeMap::new())
      .await
      .unwrap_err();
    assert!(matches!(err, ExecutionError::Spawn { .. }));
  }
}
