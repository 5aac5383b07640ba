//! Log record encodings: `Insert log` and `Update log`.

use crate::common::{
    bytes_to_u16, bytes_to_u32, bytes_to_u64, u16_to_bytes, u32_to_bytes, u64_to_bytes, PageNo,
    Uid, Xid,
};
use crate::error::{EngineError, Result};

const TYPE_INSERT: u8 = 0;
const TYPE_UPDATE: u8 = 1;

#[derive(Debug, Clone)]
pub enum LogRecord {
    Insert {
        xid: Xid,
        pgno: PageNo,
        offset: u16,
        raw: Vec<u8>,
    },
    Update {
        xid: Xid,
        uid: Uid,
        old_raw: Vec<u8>,
        new_raw: Vec<u8>,
    },
}

impl LogRecord {
    pub fn xid(&self) -> Xid {
        match self {
            LogRecord::Insert { xid, .. } => *xid,
            LogRecord::Update { xid, .. } => *xid,
        }
    }

    /// The page number this record could have written to, used by recovery
    /// to determine how many pages the data file must contain before replay.
    pub fn pgno_touched(&self) -> PageNo {
        match self {
            LogRecord::Insert { pgno, .. } => *pgno,
            LogRecord::Update { uid, .. } => (*uid >> 32) as PageNo,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            LogRecord::Insert {
                xid,
                pgno,
                offset,
                raw,
            } => {
                let mut out = Vec::with_capacity(1 + 8 + 4 + 2 + raw.len());
                out.push(TYPE_INSERT);
                out.extend_from_slice(&u64_to_bytes(*xid));
                out.extend_from_slice(&u32_to_bytes(*pgno));
                out.extend_from_slice(&u16_to_bytes(*offset));
                out.extend_from_slice(raw);
                out
            }
            LogRecord::Update {
                xid,
                uid,
                old_raw,
                new_raw,
            } => {
                let mut out = Vec::with_capacity(1 + 8 + 8 + old_raw.len() + new_raw.len());
                out.push(TYPE_UPDATE);
                out.extend_from_slice(&u64_to_bytes(*xid));
                out.extend_from_slice(&u64_to_bytes(*uid));
                out.extend_from_slice(old_raw);
                out.extend_from_slice(new_raw);
                out
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(EngineError::InvalidLogOp);
        }
        match data[0] {
            TYPE_INSERT => {
                if data.len() < 1 + 8 + 4 + 2 {
                    return Err(EngineError::InvalidLogOp);
                }
                let xid = bytes_to_u64(&data[1..9]);
                let pgno = bytes_to_u32(&data[9..13]);
                let offset = bytes_to_u16(&data[13..15]);
                let raw = data[15..].to_vec();
                Ok(LogRecord::Insert {
                    xid,
                    pgno,
                    offset,
                    raw,
                })
            }
            TYPE_UPDATE => {
                if data.len() < 17 || (data.len() - 17) % 2 != 0 {
                    return Err(EngineError::InvalidLogOp);
                }
                let xid = bytes_to_u64(&data[1..9]);
                let uid = bytes_to_u64(&data[9..17]);
                let n = (data.len() - 17) / 2;
                let old_raw = data[17..17 + n].to_vec();
                let new_raw = data[17 + n..].to_vec();
                Ok(LogRecord::Update {
                    xid,
                    uid,
                    old_raw,
                    new_raw,
                })
            }
            _ => Err(EngineError::InvalidLogOp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_round_trips() {
        let rec = LogRecord::Insert {
            xid: 7,
            pgno: 3,
            offset: 42,
            raw: vec![0, 0, 5, 1, 2, 3, 4, 5],
        };
        let encoded = rec.encode();
        let decoded = LogRecord::decode(&encoded).unwrap();
        match decoded {
            LogRecord::Insert { xid, pgno, offset, raw } => {
                assert_eq!(xid, 7);
                assert_eq!(pgno, 3);
                assert_eq!(offset, 42);
                assert_eq!(raw, vec![0, 0, 5, 1, 2, 3, 4, 5]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn update_round_trips() {
        let rec = LogRecord::Update {
            xid: 9,
            uid: (3u64 << 32) | 50,
            old_raw: vec![0, 0, 3, 1, 2, 3],
            new_raw: vec![0, 0, 3, 9, 9, 9],
        };
        let encoded = rec.encode();
        let decoded = LogRecord::decode(&encoded).unwrap();
        match decoded {
            LogRecord::Update { xid, uid, old_raw, new_raw } => {
                assert_eq!(xid, 9);
                assert_eq!(uid, (3u64 << 32) | 50);
                assert_eq!(old_raw, vec![0, 0, 3, 1, 2, 3]);
                assert_eq!(new_raw, vec![0, 0, 3, 9, 9, 9]);
            }
            _ => panic!("wrong variant"),
        }
    }
}
