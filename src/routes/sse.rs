use warp::Filter;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use sqlx::{Pool, Postgres};
use serde_json::json;
use uuid::Uuid;
use tracing::error;
use crate::database;

#[derive(Debug)]
struct CustomError {
  message: String
}
impl warp::reject::Reject for CustomError {}

fn with_db(db_pool: Pool<Postgres>) -> impl Filter<Extract = (Pool<Postgres>,), Error = Infallible> + Clone {
  warp::any().map(move || db_pool.clone())
}

pub fn sse_route(db_pool: Pool<Postgres>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("sse")
    .and(warp::get())
    .and(warp::query::<std::collections::HashMap<String, String>>())
    .and(with_db(db_pool))
    .and_then(handle_sse)
}

async fn handle_sse(query: std::collections::HashMap<String, String>, db_pool: Pool<Postgres>) -> Result<impl warp::Reply, warp::Rejection> {
  let task_id = query.get("task_id")
    .ok_or_else(|| warp::reject::custom(CustomError { message: "Missing task_id".to_string() }))?;
  let task_id = Uuid::parse_str(task_id)
    .map_err(|_| warp::reject::custom(CustomError { message: "Invalid task_id".to_string() }))?;

  let interval = IntervalStream::new(tokio::time::interval(Duration::from_secs(2)));
  let stream = interval.then(move |_| {
    let db_pool = db_pool.clone();
    async move {
      match database::fetch_task(&db_pool, task_id).await {
        Ok(Some(task)) => {
          if task.status != "pending" {
            let event = warp::sse::Event::default()
              .data(json!({"task_id": task_id, "state": task.status, "result": task.result}).to_string());
            return Some(Ok::<_, Infallible>(event));
          }
          None
        },
        Ok(None) => None,
        Err(e) => {
          error!("Error fetching task state: {:?}", e);
          None
        }
      }
    }
  })
    .filter_map(|x| { x });

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}
