//! Interactive SQL client: connects over TCP, reads a line from stdin, sends
//! it framed per [`ferrodb::network::protocol`], and prints the response.

use tokio::io::{stdin, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use ferrodb::network::protocol::{decode_line, encode_frame};
use ferrodb::EngineError;

#[tokio::main]
async fn main() -> ferrodb::Result<()> {
    println!("ferrodb-cli");
    println!("type SQL or 'exit' to quit");
    println!();

    let addr = std::env::var("FERRODB_ADDR").unwrap_or_else(|_| "127.0.0.1:5432".to_string());
    println!("connecting to {addr}...");
    let stream = TcpStream::connect(&addr).await.map_err(EngineError::from)?;
    let (read_half, mut write_half) = stream.into_split();
    let mut server_lines = BufReader::new(read_half).lines();
    println!("connected");
    println!();

    let mut stdin_lines = BufReader::new(stdin()).lines();
    loop {
        print!("ferrodb> ");
        std::io::Write::flush(&mut std::io::stdout()).ok();

        let line = match stdin_lines.next_line().await.map_err(EngineError::from)? {
            Some(l) => l,
            None => break,
        };
        let cmd = line.trim();
        if cmd.is_empty() {
            continue;
        }
        if cmd.eq_ignore_ascii_case("exit") || cmd.eq_ignore_ascii_case("quit") {
            println!("bye");
            break;
        }

        let mut request = vec![0u8];
        request.extend_from_slice(cmd.as_bytes());
        write_half
            .write_all(encode_frame(&request).as_bytes())
            .await
            .map_err(EngineError::from)?;

        let reply_line = match server_lines.next_line().await.map_err(EngineError::from)? {
            Some(l) => l,
            None => {
                println!("connection closed by server");
                break;
            }
        };
        match decode_line(&reply_line) {
            Some(frame) if !frame.is_empty() => {
                let body = String::from_utf8_lossy(&frame[1..]);
                if frame[0] == 0 {
                    if body.is_empty() {
                        println!("ok");
                    } else {
                        println!("{body}");
                    }
                } else {
                    println!("error: {body}");
                }
            }
            _ => println!("malformed response"),
        }
        println!();
    }
    Ok(())
}
