/*!
 * Cinder Server Main Entry Point
 *
 * Initializes logging, builds the shared Store, hydrates it from the dump
 * file, starts the periodic dump thread and then runs the reactors.
 */

use anyhow::*;
use cinder::*;
use clap::Parser;
use std::sync::Arc;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    // Respects RUST_LOG, e.g. RUST_LOG=debug cargo run --release
    env_logger::init();

    let cfg = Config::parse();
    let addr = cfg.socket_addr()?;
    let store = Arc::new(Store::new());

    if cfg.no_load {
        log::info!("starting with an empty key space");
    } else if cfg.dump_file.exists() {
        if store.load(&cfg.dump_file) {
            log::info!(
                "loaded {} keys from {}",
                store.keys().len(),
                cfg.dump_file.display()
            );
        } else {
            log::warn!("could not load {}, starting empty", cfg.dump_file.display());
        }
    } else {
        log::info!("no dump file at {}, starting empty", cfg.dump_file.display());
    }

    // Kept alive for the lifetime of the server
    let _scheduler = match cfg.dump_every() {
        Some(every) => Some(spawn_dump_scheduler(store.clone(), cfg.dump_file.clone(), every)?),
        None => None,
    };

    println!("cinder running on {}", addr);
    net::run(addr, cfg.worker_count(), store)
}
