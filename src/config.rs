/*!
 * Server Configuration
 *
 * Command-line flags, each with an environment variable fallback.
 */

use crate::{DEFAULT_DUMP_FILE, DEFAULT_PORT};
use anyhow::{Context, Result};
use clap::Parser;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "cinder", version, about = "Redis-compatible in-memory key-value store")]
pub struct Config {
    /// Address to bind
    #[arg(long, env = "CINDER_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Port to listen on
    #[arg(short, long, env = "CINDER_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// File used for the startup load and periodic dumps
    #[arg(long, env = "CINDER_DUMP_FILE", default_value = DEFAULT_DUMP_FILE)]
    pub dump_file: PathBuf,

    /// Seconds between periodic dumps, 0 disables them
    #[arg(long, env = "CINDER_DUMP_INTERVAL", default_value_t = 300)]
    pub dump_interval: u64,

    /// Start empty instead of loading the dump file
    #[arg(long)]
    pub no_load: bool,

    /// Reactor threads (defaults to available parallelism)
    #[arg(long, env = "CINDER_WORKERS")]
    pub workers: Option<usize>,
}

impl Config {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        (self.bind.as_str(), self.port)
            .to_socket_addrs()
            .with_context(|| format!("cannot resolve {}:{}", self.bind, self.port))?
            .next()
            .with_context(|| format!("no address for {}:{}", self.bind, self.port))
    }

    pub fn dump_every(&self) -> Option<Duration> {
        (self.dump_interval > 0).then(|| Duration::from_secs(self.dump_interval))
    }

    pub fn worker_count(&self) -> usize {
        self.workers
            .filter(|&n| n > 0)
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4))
    }
}
