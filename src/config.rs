use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::io::net::{Binding, Port, DEFAULT_PORT};

/// Runtime options. The role is fixed for the process lifetime: passing
/// `--replicaof` makes the server a replica of that master.
#[derive(Parser, Debug, Clone)]
#[command(name = "redlite", about = "In-memory RESP key-value and stream server")]
pub struct Config {
    /// TCP listen port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: Port,

    /// Master to replicate from, as "host port" or "host:port"
    #[arg(long, value_name = "HOST PORT")]
    pub replicaof: Option<String>,

    /// Directory holding the optional snapshot file
    #[arg(long, default_value = ".")]
    pub dir: String,

    /// Snapshot filename inside --dir
    #[arg(long, default_value = "dump.rdb")]
    pub dbfilename: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Replica,
}

impl Config {
    pub fn role(&self) -> Role {
        if self.replicaof.is_some() {
            Role::Replica
        } else {
            Role::Master
        }
    }

    pub fn master_binding(&self) -> Result<Option<Binding>> {
        self.replicaof.as_deref().map(str::parse).transpose()
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.dir).join(&self.dbfilename)
    }
}
