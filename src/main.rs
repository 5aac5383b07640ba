//! Server entry point: tracing-subscriber init, a startup banner, and a
//! default config before handing off to the TCP server.

use ferrodb::network::Server;
use ferrodb::{Engine, EngineConfig, Result};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    print_banner();

    let path_prefix = std::env::var("FERRODB_PATH").unwrap_or_else(|_| "./ferrodb".to_string());
    let addr = std::env::var("FERRODB_ADDR").unwrap_or_else(|_| "127.0.0.1:5432".to_string());

    let config = EngineConfig::new(path_prefix);
    tracing::info!(path_prefix = %config.path_prefix, "opening engine");
    let engine = Engine::open(config.clone())?;

    println!("ferrodb is ready to accept connections at {addr}");
    println!("connect with: ferrodb-cli");
    println!();

    let server = Server::new(engine.catalog.clone(), engine.vm.clone(), config);
    let result = server.run(&addr);

    if let Err(ref e) = result {
        tracing::warn!(error = %e, "server stopped with error");
    }
    engine.close()?;
    result.map_err(ferrodb::EngineError::from)
}

fn print_banner() {
    println!("================================================");
    println!(" ferrodb - transactional storage engine");
    println!("================================================");
    println!();
}
