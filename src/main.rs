use std::net::TcpListener;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use redlite::config::Config;
use redlite::io::net::Binding;
use redlite::master::{self, MasterServer};
use redlite::redis::RedisServer;
use redlite::replica;

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();

    let config = Config::parse();
    let binding = Binding("127.0.0.1".to_string(), config.port);
    let listener = TcpListener::bind(binding.to_string())?;

    match config.master_binding()? {
        None => {
            let redis = RedisServer::new(&config, binding.clone(), true)?;
            info!("starting master on {}", binding);
            master::serve(listener, MasterServer::new(redis))
        }
        Some(master_binding) => {
            let redis = RedisServer::new(&config, binding.clone(), false)?;
            info!("starting replica of {} on {}", master_binding, binding);
            replica::start_replication(redis.clone(), master_binding)?;
            replica::serve(listener, redis)
        }
    }
}
