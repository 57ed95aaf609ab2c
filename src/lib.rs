use std::process::ExitCode;

use clap::Parser;

pub mod bootstrap;
pub mod config;
pub mod media;
pub mod player;
pub mod sync;

pub use bootstrap::{BootstrapError, Cli};
pub use config::AppConfig;

fn init_logging(filter: Option<&str>) {
  let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
  if let Some(filter) = filter {
    builder.parse_filters(filter);
  }
  builder.format_timestamp_millis().init();
}

pub fn run() -> ExitCode {
  let cli = Cli::parse();
  init_logging(cli.log_level.as_deref());

  let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
    Ok(runtime) => runtime,
    Err(e) => {
      log::error!("Failed to start async runtime: {}", e);
      return ExitCode::FAILURE;
    }
  };

  match runtime.block_on(bootstrap::run(cli)) {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      log::error!("{}", e);
      ExitCode::FAILURE
    }
  }
}
