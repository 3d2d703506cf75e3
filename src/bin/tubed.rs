//! Minimal standalone server: loads a YAML config (if given), wires up
//! the default identity-echo pipeline, and runs the accept loop.

use std::sync::Arc;

use tube::config::Config;
use tube::pipeline::Pipeline;
use tube::server::Server;
use tube::stages::parser::EchoHandler;

fn main() {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => match Config::from_file(&path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("failed to load config from {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    let addr = config.listen_addr.clone();

    let pipeline = match Pipeline::build(config, Arc::new(EchoHandler)) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("failed to build pipeline: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = Server::new(pipeline).run(&addr) {
        eprintln!("server exited: {}", e);
        std::process::exit(1);
    }
}
