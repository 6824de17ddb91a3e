use std::path::PathBuf;
use std::sync::Arc;
use warp::Filter;
use bjqs::config::Config;
use bjqs::database::setup_database;
use bjqs::messaging::{create_rabbit_channel, declare_queues};
use bjqs::remote::{RemoteExec, SshExecutor};
use bjqs::routes::routes;
use bjqs::slurm::BatchJobClient;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt::init();
  let config = Config::from_env();
  let db_pool = setup_database(&config.database_url).await;
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
  let batch_client = Arc::new(BatchJobClient::new(executor));

  let api = routes(db_pool, rabbit_channel, batch_client)
    .or(warp::path("metrics").map(|| "prometheus_metrics_placeholder"));

  warp::serve(api)
    .run(([0, 0, 0, 0], config.server_port))
    .await;
}
