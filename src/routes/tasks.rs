use warp::Filter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;
use sqlx::Pool;
use sqlx::Postgres;
use lapin::Channel;
use regex::Regex;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{info, error};
use crate::database;
use crate::messaging::{publish_message, TASK_QUEUE};
use crate::models::{JobSpec, Resources, SolutionIdentity, TaskMessage, TaskState};
use crate::script;
use crate::slurm::BatchJobClient;

static RECENT_JOBS_LIMIT: i64 = 20;

#[derive(Deserialize)]
pub struct SubmitJobRequest {
  pub catalog: String,
  pub group: String,
  pub name: String,
  pub version: String,
  pub resources: Resources,
  pub arguments: Option<BTreeMap<String, String>>,
  pub target_host: String,
}

#[derive(Deserialize)]
pub struct LocalRunRequest {
  pub catalog: String,
  pub group: String,
  pub name: String,
  pub version: String,
  pub arguments: Option<BTreeMap<String, String>>,
}

#[derive(Serialize)]
pub struct TaskResponse {
  pub task_id: Uuid,
  pub status: String,
  pub sse_url: String,
}

#[derive(Debug)]
struct CustomError {
  message: String
}
impl warp::reject::Reject for CustomError {}

fn reject(message: impl Into<String>) -> warp::Rejection {
  warp::reject::custom(CustomError { message: message.into() })
}

fn valid_argument_name(name: &str) -> bool {
  let re = Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap();
  re.is_match(name)
}

fn validate_spec(spec: &JobSpec) -> Result<(), String> {
  if spec.resources.cpus < 1 {
    return Err("'resources.cpus' must be at least 1".into());
  }
  let memory = Regex::new(r"^[0-9]+[KMGT]?$").unwrap();
  if !memory.is_match(&spec.resources.memory) {
    return Err(format!("Invalid memory request '{}'", spec.resources.memory));
  }
  if spec.target_host.trim().is_empty() {
    return Err("Missing 'target_host'".into());
  }
  validate_arguments(&spec.arguments)
}

fn validate_arguments(arguments: &BTreeMap<String, String>) -> Result<(), String> {
  for (name, value) in arguments {
    if !valid_argument_name(name) {
      return Err(format!("Invalid argument name '{}'", name));
    }
    if value.contains('\0') {
      return Err(format!("Invalid value for argument '{}'", name));
    }
  }
  Ok(())
}

fn with_db(db_pool: Pool<Postgres>) -> impl Filter<Extract = (Pool<Postgres>,), Error = Infallible> + Clone {
  warp::any().map(move || db_pool.clone())
}

fn with_channel(channel: Channel) -> impl Filter<Extract = (Channel,), Error = Infallible> + Clone {
  warp::any().map(move || channel.clone())
}

fn with_client(client: Arc<BatchJobClient>) -> impl Filter<Extract = (Arc<BatchJobClient>,), Error = Infallible> + Clone {
  warp::any().map(move || client.clone())
}

pub fn submit_job_route(db_pool: Pool<Postgres>, rabbit_channel: Channel) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("jobs")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::body::json())
    .and(with_db(db_pool))
    .and(with_channel(rabbit_channel))
    .and_then(handle_submit_job)
}

pub fn local_run_route(db_pool: Pool<Postgres>, rabbit_channel: Channel) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("runs")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::body::json())
    .and(with_db(db_pool))
    .and(with_channel(rabbit_channel))
    .and_then(handle_local_run)
}

pub fn task_state_route(db_pool: Pool<Postgres>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("tasks")
    .and(warp::path::param::<Uuid>())
    .and(warp::path::end())
    .and(warp::get())
    .and(with_db(db_pool))
    .and_then(handle_task_state)
}

pub fn recent_jobs_route(db_pool: Pool<Postgres>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("jobs")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_db(db_pool))
    .and_then(handle_recent_jobs)
}

pub fn job_output_route(db_pool: Pool<Postgres>, batch_client: Arc<BatchJobClient>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("jobs")
    .and(warp::path::param::<Uuid>())
    .and(warp::path("output"))
    .and(warp::path::end())
    .and(warp::get())
    .and(with_db(db_pool))
    .and(with_client(batch_client))
    .and_then(handle_job_output)
}

async fn handle_submit_job(request: SubmitJobRequest, db_pool: Pool<Postgres>, channel: Channel) -> Result<impl warp::Reply, warp::Rejection> {
  let spec = JobSpec {
    identity: SolutionIdentity {
      catalog: request.catalog,
      group: request.group,
      name: request.name,
      version: request.version,
    },
    resources: request.resources,
    arguments: request.arguments.unwrap_or_default(),
    target_host: request.target_host,
  };
  if let Err(e) = validate_spec(&spec) {
    error!("Job spec validation failed: {}", e);
    return Err(reject(e));
  }

  let task_id = Uuid::new_v4();
  let message = TaskMessage::SubmitJob { task_id, spec: spec.clone() };

  let payload = serde_json::to_value(&spec)
    .map_err(|_| reject("Serialization failed."))?;
  database::insert_task(&db_pool, task_id, message.kind(), &payload)
    .await
    .map_err(|e| {
      error!("DB insertion failed: {:?}", e);
      reject("Database insertion failed.")
    })?;

  let arguments = serde_json::to_value(&spec.arguments)
    .map_err(|_| reject("Serialization failed."))?;
  database::insert_submission(&db_pool, task_id, &spec.identity.coordinate(), &arguments, &spec.target_host)
    .await
    .map_err(|e| {
      error!("Failed to record job submission {}: {:?}", task_id, e);
      reject("Database insertion failed.")
    })?;

  let payload_bytes = serde_json::to_vec(&message)
    .map_err(|_| reject("Serialization failed."))?;
  publish_message(&channel, TASK_QUEUE, &payload_bytes)
    .await
    .map_err(|e| {
      error!("Failed to publish task {}: {:?}", task_id, e);
      reject("An error occurred when publishing task.")
    })?;

  info!("Job submission task {} accepted", task_id);
  Ok(warp::reply::json(&TaskResponse {
    task_id,
    status: "submitted".into(),
    sse_url: format!("/sse?task_id={}", task_id),
  }))
}

async fn handle_local_run(request: LocalRunRequest, db_pool: Pool<Postgres>, channel: Channel) -> Result<impl warp::Reply, warp::Rejection> {
  let identity = SolutionIdentity {
    catalog: request.catalog,
    group: request.group,
    name: request.name,
    version: request.version,
  };
  let arguments = request.arguments.unwrap_or_default();
  if let Err(e) = validate_arguments(&arguments) {
    error!("Local run validation failed: {}", e);
    return Err(reject(e));
  }

  let task_id = Uuid::new_v4();
  let message = TaskMessage::LocalRun { task_id, identity: identity.clone(), arguments: arguments.clone() };

  let payload = json!({ "identity": identity, "arguments": arguments });
  database::insert_task(&db_pool, task_id, message.kind(), &payload)
    .await
    .map_err(|e| {
      error!("DB insertion failed: {:?}", e);
      reject("Database insertion failed.")
    })?;

  let payload_bytes = serde_json::to_vec(&message)
    .map_err(|_| reject("Serialization failed."))?;
  publish_message(&channel, TASK_QUEUE, &payload_bytes)
    .await
    .map_err(|e| {
      error!("Failed to publish task {}: {:?}", task_id, e);
      reject("An error occurred when publishing task.")
    })?;

  info!("Local run task {} accepted", task_id);
  Ok(warp::reply::json(&TaskResponse {
    task_id,
    status: "submitted".into(),
    sse_url: format!("/sse?task_id={}", task_id),
  }))
}

async fn handle_task_state(task_id: Uuid, db_pool: Pool<Postgres>) -> Result<impl warp::Reply, warp::Rejection> {
  let task = database::fetch_task(&db_pool, task_id)
    .await
    .map_err(|e| {
      error!("Error fetching task {}: {:?}", task_id, e);
      reject("Database query failed.")
    })?
    .ok_or_else(warp::reject::not_found)?;

  let body = match TaskState::parse(&task.status) {
    Some(TaskState::Failure) => json!({ "task_id": task.id, "state": task.status, "error": task.result }),
    _ => json!({ "task_id": task.id, "state": task.status, "result": task.result }),
  };
  Ok(warp::reply::json(&body))
}

async fn handle_recent_jobs(db_pool: Pool<Postgres>) -> Result<impl warp::Reply, warp::Rejection> {
  let submissions = database::recent_submissions(&db_pool, RECENT_JOBS_LIMIT)
    .await
    .map_err(|e| {
      error!("Error fetching recent submissions: {:?}", e);
      reject("Database query failed.")
    })?;
  Ok(warp::reply::json(&submissions))
}

async fn handle_job_output(task_id: Uuid, db_pool: Pool<Postgres>, client: Arc<BatchJobClient>) -> Result<impl warp::Reply, warp::Rejection> {
  let submission = database::fetch_submission(&db_pool, task_id)
    .await
    .map_err(|e| {
      error!("Error fetching submission {}: {:?}", task_id, e);
      reject("Database query failed.")
    })?
    .ok_or_else(warp::reject::not_found)?;

  let remote_job_id = submission.remote_job_id
    .ok_or_else(|| reject("Job has no remote job id yet."))?;
  let job_name = script::sanitize_job_name(&submission.solution);
  let output_file = script::output_file_name(&job_name, &remote_job_id);

  let output = client.fetch_output(&submission.target_host, &output_file)
    .await
    .map_err(|e| {
      error!("Failed to fetch output for task {}: {}", task_id, e);
      reject("Failed to fetch job output.")
    })?;

  Ok(warp::reply::json(&json!({
    "task_id": task_id,
    "remote_job_id": remote_job_id,
    "output_file": output_file,
    "output": output,
  })))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn spec(cpus: u32, memory: &str, target_host: &str) -> JobSpec {
    JobSpec {
      identity: SolutionIdentity {
        catalog: "c".into(),
        group: "g".into(),
        name: "n".into(),
        version: "1.0".into(),
      },
      resources: Resources { cpus, memory: memory.into(), gpus: 0 },
      arguments: BTreeMap::new(),
      target_host: target_host.into(),
    }
  }

  #[test]
  fn rejects_zero_cpus() {
    assert!(validate_spec(&spec(0, "8G", "h1")).is_err());
    assert!(validate_spec(&spec(1, "8G", "h1")).is_ok());
  }

  #[test]
  fn rejects_malformed_memory_requests() {
    assert!(validate_spec(&spec(1, "8G", "h1")).is_ok());
    assert!(validate_spec(&spec(1, "125", "h1")).is_ok());
    assert!(validate_spec(&spec(1, "8 gigs", "h1")).is_err());
    assert!(validate_spec(&spec(1, "G8", "h1")).is_err());
  }

  #[test]
  fn rejects_missing_target_host() {
    assert!(validate_spec(&spec(1, "8G", "  ")).is_err());
  }

  #[test]
  fn rejects_unsafe_argument_names_but_not_values() {
    let mut arguments = BTreeMap::new();
    arguments.insert("input path".to_string(), "x".to_string());
    assert!(validate_arguments(&arguments).is_err());

    let mut arguments = BTreeMap::new();
    arguments.insert("input".to_string(), "/data/my run; echo".to_string());
    assert!(validate_arguments(&arguments).is_ok());
  }
}
