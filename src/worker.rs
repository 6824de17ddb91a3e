use lapin::{options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions}, types::FieldTable};
use serde_json::json;
use sqlx::{Pool, Postgres};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, error};
use uuid::Uuid;
use futures::StreamExt;
use bjqs::config::Config;
use bjqs::database::{self, setup_database};
use bjqs::messaging::{create_rabbit_channel, declare_queues, TASK_QUEUE};
use bjqs::models::TaskMessage;
use bjqs::remote::{RemoteExec, SshExecutor};
use bjqs::slurm::BatchJobClient;
use bjqs::worker_processing::{process_local_run, process_poll_job, process_submit_job, WorkerEnv};
use bjqs::worker_scheduler::{Scheduler, ScheduledTask};

static MAX_TASK_ATTEMPTS: i32 = 5;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt::init();
  let config = Config::from_env();
  let worker_id = env::var("WORKER_ID").unwrap_or_else(|_| format!("worker-{}", Uuid::new_v4()));

  let db_pool: Pool<Postgres> = setup_database(&config.database_url).await;
  let rabbit_channel = create_rabbit_channel(&config.rabbitmq_url)
    .await
    .expect("Failed to create RabbitMQ channel");
  declare_queues(&rabbit_channel)
    .await
    .expect("Queue declaration failed");

  let executor: Arc<dyn RemoteExec> = Arc::new(SshExecutor::new(
    config.ssh_user.clone(),
    config.ssh_key_path.clone().map(PathBuf::from),
  ));
  let env = Arc::new(WorkerEnv {
    db: db_pool.clone(),
    channel: rabbit_channel.clone(),
    batch: Arc::new(BatchJobClient::new(executor)),
    poll_interval: Duration::from_secs(config.poll_interval_secs),
    max_poll_attempts: config.max_poll_attempts,
    solution_bin: config.solution_bin.clone(),
    worker_id: worker_id.clone(),
  });

  let mut consumer = rabbit_channel
    .basic_consume(TASK_QUEUE, "worker", BasicConsumeOptions::default(), FieldTable::default())
    .await
    .expect("Failed to start consumer");

  let scheduler = Arc::new(Scheduler::new());
  let semaphore = Arc::new(Semaphore::new(config.worker_concurrency));

  let scheduler_consumer = scheduler.clone();
  tokio::spawn(async move {
    while let Some(delivery) = consumer.next().await {
      match delivery {
        Ok(delivery) => {
          match serde_json::from_slice::<TaskMessage>(&delivery.data) {
            Ok(message) => {
              let scheduled_task = ScheduledTask {
                priority: message.priority(),
                delivery,
                message,
              };
              scheduler_consumer.add_task(scheduled_task).await;
            }
            Err(e) => {
              error!("Failed to parse task message: {:?}", e);
              let _ = delivery.ack(BasicAckOptions::default()).await;
            }
          }
        }
        Err(e) => error!("Consumer error: {:?}", e),
      }
    }
  });

  loop {
    if let Some(scheduled_task) = scheduler.get_next().await {
      let permit = semaphore.clone().acquire_owned().await.unwrap();
      let env = env.clone();
      let delivery = scheduled_task.delivery;
      let message = scheduled_task.message;
      tokio::spawn(async move {
        let task_id = message.task_id();
        let kind = message.kind();
        let processing_result = match message {
          TaskMessage::SubmitJob { spec, .. } => process_submit_job(&env, task_id, spec).await,
          TaskMessage::PollJob { handle, job_name, attempts, .. } => {
            process_poll_job(&env, task_id, handle, job_name, attempts).await
          }
          TaskMessage::LocalRun { identity, arguments, .. } => {
            process_local_run(&env, task_id, identity, arguments).await
          }
        };
        match processing_result {
          Ok(_) => {
            info!("Task {} ({}) processed", task_id, kind);
            let _ = delivery.ack(BasicAckOptions::default()).await;
          }
          Err(e) => {
            error!("Processing failed for task {}: {:?}", task_id, e);
            match database::bump_attempts(&env.db, task_id).await {
              Ok(attempts) if attempts < MAX_TASK_ATTEMPTS => {
                error!("Retrying task {} (attempt {})", task_id, attempts);
                let _ = delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await;
              }
              Ok(_) => {
                error!("Max attempts reached for task {}. Marking as failed.", task_id);
                let cause = json!({
                  "kind": "worker_error",
                  "message": format!("{e:#}"),
                });
                let _ = database::mark_failure(&env.db, task_id, cause).await;
                let _ = delivery.ack(BasicAckOptions::default()).await;
              }
              Err(err) => {
                error!("Failed to update attempt count for task {}: {:?}", task_id, err);
                let _ = delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await;
              }
            }
          }
        }
        drop(permit);
      });
    } else {
      tokio::time::sleep(Duration::from_millis(100)).await;
    }
  }
}
