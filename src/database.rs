use chrono::Utc;
use serde_json::Value;
use sqlx::{Pool, Postgres};
use sqlx::migrate::Migrator;
use tracing::info;
use uuid::Uuid;
use crate::models::{JobSubmission, Task};

static MIGRATOR: Migrator = sqlx::migrate!();

pub async fn setup_database(database_url: &str) -> Pool<Postgres> {
  let pool = Pool::<Postgres>::connect(database_url)
    .await
    .expect("Failed to connect to database.");

  MIGRATOR.run(&pool)
    .await
    .expect("Failed to run database migrations.");
  info!("Database migrations complete");
  pool
}

pub async fn insert_task(
  pool: &Pool<Postgres>,
  task_id: Uuid,
  task_type: &str,
  payload: &Value,
) -> sqlx::Result<()> {
  sqlx::query(
    "INSERT INTO tasks (id, task_type, payload, status, attempts, created_at, updated_at)
     VALUES ($1, $2, $3, 'pending', 0, $4, $4)",
  )
    .bind(task_id)
    .bind(task_type)
    .bind(payload)
    .bind(Utc::now())
    .execute(pool)
    .await?;
  Ok(())
}

pub async fn fetch_task(pool: &Pool<Postgres>, task_id: Uuid) -> sqlx::Result<Option<Task>> {
  sqlx::query_as::<_, Task>(
    "SELECT id, task_type, payload, status, result, attempts, created_at, updated_at
     FROM tasks WHERE id = $1",
  )
    .bind(task_id)
    .fetch_optional(pool)
    .await
}

// Non-terminal transitions only; 'success' and 'failure' are immutable.
pub async fn mark_started(pool: &Pool<Postgres>, task_id: Uuid) -> sqlx::Result<()> {
  sqlx::query(
    "UPDATE tasks SET status = 'started', updated_at = NOW()
     WHERE id = $1 AND status IN ('pending', 'started')",
  )
    .bind(task_id)
    .execute(pool)
    .await?;
  Ok(())
}

pub async fn mark_success(pool: &Pool<Postgres>, task_id: Uuid, result: Value) -> sqlx::Result<bool> {
  let updated = sqlx::query(
    "UPDATE tasks SET status = 'success', result = $2, updated_at = NOW()
     WHERE id = $1 AND status NOT IN ('success', 'failure')",
  )
    .bind(task_id)
    .bind(result)
    .execute(pool)
    .await?;
  Ok(updated.rows_affected() > 0)
}

pub async fn mark_failure(pool: &Pool<Postgres>, task_id: Uuid, cause: Value) -> sqlx::Result<bool> {
  let updated = sqlx::query(
    "UPDATE tasks SET status = 'failure', result = $2, updated_at = NOW()
     WHERE id = $1 AND status NOT IN ('success', 'failure')",
  )
    .bind(task_id)
    .bind(cause)
    .execute(pool)
    .await?;
  Ok(updated.rows_affected() > 0)
}

pub async fn bump_attempts(pool: &Pool<Postgres>, task_id: Uuid) -> sqlx::Result<i32> {
  sqlx::query_scalar::<_, i32>(
    "UPDATE tasks SET attempts = attempts + 1, updated_at = NOW()
     WHERE id = $1 RETURNING attempts",
  )
    .bind(task_id)
    .fetch_one(pool)
    .await
}

pub async fn insert_submission(
  pool: &Pool<Postgres>,
  task_id: Uuid,
  solution: &str,
  arguments: &Value,
  target_host: &str,
) -> sqlx::Result<()> {
  sqlx::query(
    "INSERT INTO job_submissions (id, task_id, solution, arguments, target_host, submitted_at)
     VALUES ($1, $2, $3, $4, $5, $6)",
  )
    .bind(Uuid::new_v4())
    .bind(task_id)
    .bind(solution)
    .bind(arguments)
    .bind(target_host)
    .bind(Utc::now())
    .execute(pool)
    .await?;
  Ok(())
}

pub async fn record_remote_job(pool: &Pool<Postgres>, task_id: Uuid, remote_job_id: &str) -> sqlx::Result<()> {
  sqlx::query("UPDATE job_submissions SET remote_job_id = $2 WHERE task_id = $1")
    .bind(task_id)
    .bind(remote_job_id)
    .execute(pool)
    .await?;
  Ok(())
}

pub async fn fetch_submission(pool: &Pool<Postgres>, task_id: Uuid) -> sqlx::Result<Option<JobSubmission>> {
  sqlx::query_as::<_, JobSubmission>(
    "SELECT id, task_id, solution, arguments, target_host, submitted_at, remote_job_id
     FROM job_submissions WHERE task_id = $1",
  )
    .bind(task_id)
    .fetch_optional(pool)
    .await
}

pub async fn recent_submissions(pool: &Pool<Postgres>, limit: i64) -> sqlx::Result<Vec<JobSubmission>> {
  sqlx::query_as::<_, JobSubmission>(
    "SELECT id, task_id, solution, arguments, target_host, submitted_at, remote_job_id
     FROM job_submissions ORDER BY submitted_at DESC LIMIT $1",
  )
    .bind(limit)
    .fetch_all(pool)
    .await
}
