//! TCP server: one OS thread per accepted connection, each owning its own
//! [`Executor`]. Plain `std::net`/`std::thread`, not an async accept loop —
//! each client connection is handled synchronously by one worker for its
//! whole lifetime.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::execution::Executor;
use crate::network::protocol::{decode_line, encode_err, encode_frame, encode_ok, format_result};
use crate::parser;
use crate::vm::Vm;

pub struct Server {
    catalog: Arc<Catalog>,
    vm: Arc<Vm>,
    config: EngineConfig,
}

impl Server {
    pub fn new(catalog: Arc<Catalog>, vm: Arc<Vm>, config: EngineConfig) -> Self {
        Self { catalog, vm, config }
    }

    /// Binds `addr` and blocks forever, accepting connections and spawning
    /// one worker thread per connection.
    pub fn run(&self, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr)?;
        tracing::info!(addr, "listening");
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept connection");
                    continue;
                }
            };
            let catalog = Arc::clone(&self.catalog);
            let vm = Arc::clone(&self.vm);
            let config = self.config.clone();
            thread::spawn(move || {
                let peer = stream.peer_addr().ok();
                if let Err(e) = handle_connection(stream, catalog, vm, config) {
                    tracing::warn!(?peer, error = %e, "connection ended with error");
                }
            });
        }
        Ok(())
    }
}

fn handle_connection(
    stream: TcpStream,
    catalog: Arc<Catalog>,
    vm: Arc<Vm>,
    config: EngineConfig,
) -> std::io::Result<()> {
    let mut writer = stream.try_clone()?;
    let reader = BufReader::new(stream);
    let mut executor = Executor::new(catalog, vm, &config);

    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let frame = match decode_line(&line) {
            Some(f) => f,
            None => {
                writer.write_all(encode_frame(&encode_err("malformed frame")).as_bytes())?;
                continue;
            }
        };
        // flag byte is ignored on requests; the whole body is the SQL text.
        let sql = String::from_utf8_lossy(&frame[1.min(frame.len())..]).into_owned();

        let response = match parser::parse(&sql).and_then(|stmt| executor.execute(stmt)) {
            Ok(result) => encode_ok(&format_result(&result)),
            Err(e) => encode_err(&e.to_string()),
        };
        writer.write_all(encode_frame(&response).as_bytes())?;
        writer.flush()?;
    }
    Ok(())
}
