use lapin::{Connection, ConnectionProperties, Channel, options::{BasicPublishOptions, QueueDeclareOptions}, types::{AMQPValue, FieldTable}, BasicProperties};
use std::time::Duration;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::info;
use anyhow::Result;

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

pub static TASK_QUEUE: &str = "task_queue";
pub static TASK_DELAY_QUEUE: &str = "task_delay_queue";

pub async fn create_rabbit_channel(rabbitmq_url: &str) -> Result<Channel> {
  let conn = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
    Connection::connect(rabbitmq_url, ConnectionProperties::default())
  })
    .await?;
  let channel = conn.create_channel().await?;
  info!("RabbitMQ channel created");
  Ok(channel)
}

// The delay queue has no consumers; expired messages dead-letter back into
// the work queue, which is what turns a poll re-enqueue into a timed retry.
pub async fn declare_queues(channel: &Channel) -> Result<()> {
  let options = QueueDeclareOptions { durable: true, ..Default::default() };
  channel.queue_declare(TASK_QUEUE, options, FieldTable::default()).await?;

  let mut args = FieldTable::default();
  args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
  args.insert("x-dead-letter-routing-key".into(), AMQPValue::LongString(TASK_QUEUE.into()));
  channel.queue_declare(TASK_DELAY_QUEUE, options, args).await?;
  Ok(())
}

pub async fn publish_message(channel: &Channel, queue: &str, payload: &[u8]) -> Result<()> {
  Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || async {
    channel.basic_publish("", queue, BasicPublishOptions::default(), payload, BasicProperties::default()).await
  })
    .await?;
  Ok(())
}

pub async fn publish_delayed(channel: &Channel, payload: &[u8], delay: Duration) -> Result<()> {
  let expiration = delay.as_millis().to_string();
  Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
    let expiration = expiration.clone();
    async move {
      channel.basic_publish(
        "",
        TASK_DELAY_QUEUE,
        BasicPublishOptions::default(),
        payload,
        BasicProperties::default().with_expiration(expiration.into()),
      ).await
    }
  })
    .await?;
  Ok(())
}
