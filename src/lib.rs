// Core modules for Cinder key-value store
pub mod protocol; // request tokenizer + RESP reply writers
pub mod storage; // Store: typed key space, expiry, dump/load
pub mod persist; // dump file records + periodic dump scheduler
pub mod command; // Cmd parsing, validation and execution
pub mod net; // bind_reuseport + run (server loop)
pub mod config; // CLI / environment configuration

// Re-export all public items from modules for easier access
pub use protocol::*;
pub use storage::*;
pub use persist::*;
pub use command::*;
pub use net::*;
pub use config::*;

// Default server port - standard Redis port
pub const DEFAULT_PORT: u16 = 6379;

// Default dump file used by the binary for startup load and periodic dumps
pub const DEFAULT_DUMP_FILE: &str = "dump.cinder";
