//! Transaction manager: assigns XIDs and persists one status byte per XID in
//! `P.xid`, rather than keeping an in-memory `Transaction` map (the VM owns
//! that, see [`crate::vm`]).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use parking_lot::Mutex;

use crate::common::{bytes_to_u64, u64_to_bytes, Xid, SUPER_XID};
use crate::error::{fatal, EngineError, Result};

const HEADER_LEN: u64 = 8;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum XidStatus {
    Active,
    Committed,
    Aborted,
}

impl XidStatus {
    fn to_byte(self) -> u8 {
        match self {
            XidStatus::Active => 0,
            XidStatus::Committed => 1,
            XidStatus::Aborted => 2,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(XidStatus::Active),
            1 => Ok(XidStatus::Committed),
            2 => Ok(XidStatus::Aborted),
            _ => Err(EngineError::BadXidFile),
        }
    }
}

struct Inner {
    file: File,
    count: Xid,
}

/// Owns the `P.xid` file. One `Tm` per [`crate::engine::Engine`] instance —
/// no process-global XID counter.
pub struct Tm {
    inner: Mutex<Inner>,
}

impl Tm {
    /// Creates a fresh XID file (truncating any existing one) with count=0.
    pub fn create(path: &str) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&u64_to_bytes(0))?;
        file.sync_all()?;
        Ok(Self {
            inner: Mutex::new(Inner { file, count: 0 }),
        })
    }

    /// Opens an existing XID file, validating its size equals `8 + count`.
    pub fn open(path: &str) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < HEADER_LEN {
            return Err(EngineError::BadXidFile);
        }
        let mut header = [0u8; 8];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let count = bytes_to_u64(&header);
        if len != HEADER_LEN + count {
            return Err(EngineError::BadXidFile);
        }
        Ok(Self {
            inner: Mutex::new(Inner { file, count }),
        })
    }

    fn status_offset(xid: Xid) -> u64 {
        HEADER_LEN + (xid - 1)
    }

    fn write_status(inner: &mut Inner, xid: Xid, status: XidStatus) -> Result<()> {
        inner
            .file
            .seek(SeekFrom::Start(Self::status_offset(xid)))?;
        inner.file.write_all(&[status.to_byte()])?;
        inner
            .file
            .sync_all()
            .unwrap_or_else(|e| fatal(format!("xid file fsync failed: {e}")));
        Ok(())
    }

    fn read_status(inner: &mut Inner, xid: Xid) -> Result<XidStatus> {
        let mut byte = [0u8; 1];
        inner
            .file
            .seek(SeekFrom::Start(Self::status_offset(xid)))?;
        inner.file.read_exact(&mut byte)?;
        XidStatus::from_byte(byte[0])
    }

    /// Begins a new transaction, persisting it as active. Returns the new XID.
    pub fn begin(&self) -> Result<Xid> {
        let mut inner = self.inner.lock();
        let xid = inner.count + 1;
        inner.file.seek(SeekFrom::Start(Self::status_offset(xid)))?;
        inner.file.write_all(&[XidStatus::Active.to_byte()])?;
        inner.count = xid;
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&u64_to_bytes(inner.count))?;
        inner
            .file
            .sync_all()
            .unwrap_or_else(|e| fatal(format!("xid file fsync failed: {e}")));
        Ok(xid)
    }

    pub fn commit(&self, xid: Xid) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::write_status(&mut inner, xid, XidStatus::Committed)
    }

    pub fn abort(&self, xid: Xid) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::write_status(&mut inner, xid, XidStatus::Aborted)
    }

    pub fn is_active(&self, xid: Xid) -> bool {
        if xid == SUPER_XID {
            return false;
        }
        let mut inner = self.inner.lock();
        matches!(Self::read_status(&mut inner, xid), Ok(XidStatus::Active))
    }

    pub fn is_committed(&self, xid: Xid) -> bool {
        if xid == SUPER_XID {
            return false;
        }
        let mut inner = self.inner.lock();
        matches!(Self::read_status(&mut inner, xid), Ok(XidStatus::Committed))
    }

    pub fn is_aborted(&self, xid: Xid) -> bool {
        if xid == SUPER_XID {
            return false;
        }
        let mut inner = self.inner.lock();
        matches!(Self::read_status(&mut inner, xid), Ok(XidStatus::Aborted))
    }

    pub fn count(&self) -> Xid {
        self.inner.lock().count
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
    fn file_size_invariant_holds() {
        let dir = tempdir().unwrap();
        let p = path(&dir, "t.xid");
        let tm = Tm::create(&p).unwrap();
        for _ in 0..10 {
            tm.begin().unwrap();
        }
        let len = std::fs::metadata(&p).unwrap().len();
        assert_eq!(len, 8 + tm.count());
        assert_eq!(tm.count(), 10);
    }

    #[test]
    fn lifecycle_transitions() {
        let dir = tempdir().unwrap();
        let p = path(&dir, "t.xid");
        let tm = Tm::create(&p).unwrap();
        let x1 = tm.begin().unwrap();
        assert!(tm.is_active(x1));
        tm.commit(x1).unwrap();
        assert!(tm.is_committed(x1));
        assert!(!tm.is_active(x1));

        let x2 = tm.begin().unwrap();
        tm.abort(x2).unwrap();
        assert!(tm.is_aborted(x2));
    }

    #[test]
    fn super_xid_is_never_anything() {
        let dir = tempdir().unwrap();
        let p = path(&dir, "t.xid");
        let tm = Tm::create(&p).unwrap();
        assert!(!tm.is_active(SUPER_XID));
        assert!(!tm.is_committed(SUPER_XID));
        assert!(!tm.is_aborted(SUPER_XID));
    }

    #[test]
    fn reopen_validates_size() {
        let dir = tempdir().unwrap();
        let p = path(&dir, "t.xid");
        {
            let tm = Tm::create(&p).unwrap();
            tm.begin().unwrap();
            tm.begin().unwrap();
        }
        let tm = Tm::open(&p).unwrap();
        assert_eq!(tm.count(), 2);
    }

    #[test]
    fn corrupted_file_rejected() {
        let dir = tempdir().unwrap();
        let p = path(&dir, "t.xid");
        {
            let tm = Tm::create(&p).unwrap();
            tm.begin().unwrap();
        }
        // Truncate to an inconsistent length.
        let f = OpenOptions::new().write(true).open(&p).unwrap();
        f.set_len(5).unwrap();
        match Tm::open(&p) {
            Err(EngineError::BadXidFile) => {}
            other => panic!("expected BadXidFile, got {other:?}"),
        }
    }
}
