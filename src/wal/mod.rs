//! Write-ahead log: `[xchecksum:4] { [size:4][checksum:4][data:size] }*`.
//! Appends are serialized behind one latch and fsynced before returning, the
//! same append/scan/rewind shape a log-structured WAL module generally takes,
//! with a fold-with-seed-13331 checksum and raw length-prefixed framing
//! instead of a general-purpose serialization codec.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use parking_lot::Mutex;

pub mod record;
pub use record::LogRecord;

use crate::common::{bytes_to_u32, u32_to_bytes};
use crate::error::{fatal, EngineError, Result};

const SEED: u32 = 13331;
const HEADER_LEN: u64 = 4;

/// Continues the fold over `data`, starting from `acc`.
fn fold(acc: u32, data: &[u8]) -> u32 {
    data.iter()
        .fold(acc, |a, &b| a.wrapping_mul(SEED).wrapping_add(b as u32))
}

/// Fresh per-record checksum: folds starting at the seed.
fn record_checksum(data: &[u8]) -> u32 {
    fold(SEED, data)
}

struct Inner {
    file: File,
    xchecksum: u32,
}

pub struct Wal {
    inner: Mutex<Inner>,
}

impl Wal {
    pub fn create(path: &str) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&u32_to_bytes(SEED))?;
        file.sync_all()?;
        Ok(Self {
            inner: Mutex::new(Inner {
                file,
                xchecksum: SEED,
            }),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut wal = Self {
            inner: Mutex::new(Inner { file, xchecksum: SEED }),
        };
        wal.recover_header()?;
        Ok(wal)
    }

    /// Reads the stored xchecksum, then re-scans every record, truncating
    /// any bad tail so the in-memory and on-disk xchecksum always agree
    /// with what's actually readable afterwards.
    fn recover_header(&mut self) -> Result<()> {
        let mut inner = self.inner.lock();
        let len = inner.file.metadata()?.len();
        if len < HEADER_LEN {
            return Err(EngineError::BadLogFile);
        }
        let mut header = [0u8; 4];
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.read_exact(&mut header)?;
        let stored = bytes_to_u32(&header);

        let mut pos = HEADER_LEN;
        let mut running = SEED;
        loop {
            match Self::read_record_at(&mut inner.file, pos, len)? {
                Some((data, record_len)) => {
                    running = fold(running, &data);
                    pos += record_len;
                }
                None => break,
            }
        }

        if running != stored || pos != len {
            inner.file.set_len(pos)?;
            inner.file.seek(SeekFrom::Start(0))?;
            inner.file.write_all(&u32_to_bytes(running))?;
            inner.file.sync_all()?;
        }
        inner.xchecksum = running;
        Ok(())
    }

    /// Reads one record at `pos`, validating its own checksum. Returns
    /// `None` (treated as end-of-log / bad tail) on any short read or
    /// checksum mismatch, never an error — a truncated trailing record is
    /// an expected post-crash condition, not a hard failure.
    fn read_record_at(file: &mut File, pos: u64, len: u64) -> Result<Option<(Vec<u8>, u64)>> {
        if pos + 8 > len {
            return Ok(None);
        }
        file.seek(SeekFrom::Start(pos))?;
        let mut size_buf = [0u8; 4];
        let mut checksum_buf = [0u8; 4];
        file.read_exact(&mut size_buf)?;
        file.read_exact(&mut checksum_buf)?;
        let size = bytes_to_u32(&size_buf) as u64;
        let checksum = bytes_to_u32(&checksum_buf);
        if pos + 8 + size > len {
            return Ok(None);
        }
        let mut data = vec![0u8; size as usize];
        file.read_exact(&mut data)?;
        if record_checksum(&data) != checksum {
            return Ok(None);
        }
        Ok(Some((data, 8 + size)))
    }

    /// Appends one record, serialized by the WAL's internal latch, and
    /// fsyncs before returning.
    pub fn append(&self, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let checksum = record_checksum(data);
        let running = fold(inner.xchecksum, data);

        let end = inner.file.metadata()?.len();
        inner.file.seek(SeekFrom::Start(end))?;
        inner.file.write_all(&u32_to_bytes(data.len() as u32))?;
        inner.file.write_all(&u32_to_bytes(checksum))?;
        inner.file.write_all(data)?;

        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&u32_to_bytes(running))?;
        inner
            .file
            .sync_all()
            .unwrap_or_else(|e| fatal(format!("wal fsync failed: {e}")));
        inner.xchecksum = running;
        Ok(())
    }

    /// Returns every valid record body, in append order.
    pub fn scan_all(&self) -> Result<Vec<Vec<u8>>> {
        let mut inner = self.inner.lock();
        let len = inner.file.metadata()?.len();
        let mut pos = HEADER_LEN;
        let mut out = Vec::new();
        loop {
            match Self::read_record_at(&mut inner.file, pos, len)? {
                Some((data, record_len)) => {
                    pos += record_len;
                    out.push(data);
                }
                None => break,
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn path(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_str().unwrap().to_string()
    }

    #[test]
    fn append_then_scan_round_trips() {
        let dir = tempdir().unwrap();
        let p = path(&dir, "t.log");
        let wal = Wal::create(&p).unwrap();
        wal.append(b"first").unwrap();
        wal.append(b"second").unwrap();

        let records = wal.scan_all().unwrap();
        assert_eq!(records, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn reopen_after_clean_close_keeps_all_records() {
        let dir = tempdir().unwrap();
        let p = path(&dir, "t.log");
        {
            let wal = Wal::create(&p).unwrap();
            wal.append(b"a").unwrap();
            wal.append(b"bb").unwrap();
        }
        let wal = Wal::open(&p).unwrap();
        let records = wal.scan_all().unwrap();
        assert_eq!(records, vec![b"a".to_vec(), b"bb".to_vec()]);
    }

    #[test]
    fn bad_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        let p = path(&dir, "t.log");
        {
            let wal = Wal::create(&p).unwrap();
            wal.append(b"good").unwrap();
        }
        // Simulate a crash mid-append: append a size header and nothing else.
        {
            let mut f = OpenOptions::new().write(true).open(&p).unwrap();
            f.seek(SeekFrom::Start(f.metadata().unwrap().len())).unwrap();
            f.write_all(&u32_to_bytes(100)).unwrap();
            f.write_all(&u32_to_bytes(0xdead_beef)).unwrap();
            f.write_all(b"short").unwrap();
        }
        let wal = Wal::open(&p).unwrap();
        let records = wal.scan_all().unwrap();
        assert_eq!(records, vec![b"good".to_vec()]);

        let len_after = std::fs::metadata(&p).unwrap().len();
        assert_eq!(len_after, HEADER_LEN + 8 + 4);
    }
}
