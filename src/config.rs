use std::env;

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  pub rabbitmq_url: String,
  pub server_port: u16,
  pub ssh_user: String,
  pub ssh_key_path: Option<String>,
  pub poll_interval_secs: u64,
  pub max_poll_attempts: u32,
  pub worker_concurrency: usize,
  pub solution_bin: String,
}

impl Config {
  pub fn from_env() -> Self {
    Self {
      database_url: env::var("DATABASE_URL").unwrap(),
      rabbitmq_url: env::var("RABBITMQ_URL").unwrap(),
      server_port: env::var("SERVER_PORT")
        .unwrap_or_else(|_| "8080".into())
        .parse()
        .unwrap_or(8080),
      ssh_user: env::var("SSH_USER")
        .or_else(|_| env::var("USER"))
        .unwrap_or_else(|_| "slurm".into()),
      ssh_key_path: env::var("SSH_KEY_PATH").ok(),
      poll_interval_secs: env::var("POLL_INTERVAL_SECS")
        .unwrap_or_else(|_| "60".into())
        .parse()
        .unwrap_or(60),
      max_poll_attempts: env::var("MAX_POLL_ATTEMPTS")
        .unwrap_or_else(|_| "1440".into())
        .parse()
        .unwrap_or(1440),
      worker_concurrency: env::var("WORKER_CONCURRENCY")
        .unwrap_or_else(|_| "4".into())
        .parse()
        .unwrap_or(4),
      solution_bin: env::var("SOLUTION_BIN").unwrap_or_else(|_| "album".into()),
    }
  }
}
