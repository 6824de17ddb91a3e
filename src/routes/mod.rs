use warp::Filter;
use sqlx::Pool;
use sqlx::Postgres;
use lapin::Channel;
use std::sync::Arc;
use crate::slurm::BatchJobClient;
pub mod tasks;
pub mod sse;

pub fn routes(
  db_pool: Pool<Postgres>,
  rabbit_channel: Channel,
  batch_client: Arc<BatchJobClient>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  tasks::submit_job_route(db_pool.clone(), rabbit_channel.clone())
    .or(tasks::local_run_route(db_pool.clone(), rabbit_channel))
    .or(tasks::task_state_route(db_pool.clone()))
    .or(tasks::recent_jobs_route(db_pool.clone()))
    .or(tasks::job_output_route(db_pool.clone(), batch_client))
    .or(sse::sse_route(db_pool))
}
