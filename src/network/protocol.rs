//! Wire framing: `[flag:1][body:*]`, with the transport layer hex-encoding
//! the whole frame and appending a newline. The wire format here is fixed
//! and small enough not to need a general-purpose serialization codec.

use crate::catalog::Value;
use crate::execution::QueryResult;

const FLAG_OK: u8 = 0;
const FLAG_ERR: u8 = 1;

/// Builds `[flag][body]` for a successful result.
pub fn encode_ok(body: &str) -> Vec<u8> {
    let mut out = vec![FLAG_OK];
    out.extend_from_slice(body.as_bytes());
    out
}

/// Builds `[flag][body]` for an error message.
pub fn encode_err(message: &str) -> Vec<u8> {
    let mut out = vec![FLAG_ERR];
    out.extend_from_slice(message.as_bytes());
    out
}

fn format_value(v: &Value) -> String {
    match v {
        Value::Int32(n) => n.to_string(),
        Value::Int64(n) => n.to_string(),
        Value::Str(s) => s.clone(),
    }
}

/// Renders a statement's outcome into the response body text (e.g. "ok",
/// "affected N", a row listing separated by LF).
pub fn format_result(result: &QueryResult) -> String {
    match result {
        QueryResult::Ok => "ok".to_string(),
        QueryResult::Affected(n) => format!("affected {n}"),
        QueryResult::Tables(names) => names.join("\n"),
        QueryResult::Rows(rows) => rows
            .iter()
            .map(|row| row.iter().map(format_value).collect::<Vec<_>>().join(" "))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Hex-encodes `frame` and appends the newline the wire protocol expects
/// between packets.
pub fn encode_frame(frame: &[u8]) -> String {
    let mut out = String::with_capacity(frame.len() * 2 + 1);
    for b in frame {
        out.push_str(&format!("{b:02x}"));
    }
    out.push('\n');
    out
}

/// Decodes one hex-encoded line (without its trailing newline) back into raw
/// frame bytes.
pub fn decode_line(line: &str) -> Option<Vec<u8>> {
    if line.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(line.len() / 2);
    let bytes = line.as_bytes();
    for chunk in bytes.chunks(2) {
        let s = std::str::from_utf8(chunk).ok()?;
        out.push(u8::from_str_radix(s, 16).ok()?);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_hex_round_trips() {
        let frame = encode_ok("affected 1");
        let line = encode_frame(&frame);
        assert!(line.ends_with('\n'));
        let decoded = decode_line(line.trim_end()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn rows_join_with_lf() {
        let result = QueryResult::Rows(vec![
            vec![Value::Int64(1), Value::Str("alice".into())],
            vec![Value::Int64(2), Value::Str("bob".into())],
        ]);
        assert_eq!(format_result(&result), "1 alice\n2 bob");
    }
}
