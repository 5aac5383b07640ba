//! Data items: allocate/read typed records inside pages, with a
//! before/after/unBefore update protocol that journals writes and serializes
//! concurrent mutators, built over [`crate::cache::RefCache`] and
//! [`crate::storage`].

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::cache::{CacheLoader, RefCache};
use crate::common::{bytes_to_u16, u16_to_bytes, uid, uid_parts, PageNo, Uid, Xid, PAGE_SIZE};
use crate::error::{EngineError, Result};
use crate::storage::{page, PageHandle, PageIndex, Pager};
use crate::wal::{LogRecord, Wal};

/// Wraps a payload into the on-page DataItem layout: `[valid:1][size:2][data]`.
fn wrap(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + payload.len());
    out.push(0); // valid
    out.extend_from_slice(&u16_to_bytes(payload.len() as u16));
    out.extend_from_slice(payload);
    out
}

struct DiState {
    writer: bool,
    readers: usize,
    old_raw: Option<Vec<u8>>,
}

struct DataItemHandle {
    pgno: PageNo,
    offset: u16,
    page: Arc<PageHandle>,
    state: Mutex<DiState>,
    cond: Condvar,
}

impl DataItemHandle {
    fn read_lock(&self) {
        let mut s = self.state.lock();
        while s.writer {
            self.cond.wait(&mut s);
        }
        s.readers += 1;
    }

    fn read_unlock(&self) {
        let mut s = self.state.lock();
        s.readers -= 1;
        if s.readers == 0 {
            self.cond.notify_all();
        }
    }

    fn write_lock(&self) {
        let mut s = self.state.lock();
        while s.writer || s.readers > 0 {
            self.cond.wait(&mut s);
        }
        s.writer = true;
    }

    fn write_unlock(&self) {
        let mut s = self.state.lock();
        s.writer = false;
        self.cond.notify_all();
    }
}

struct DmLoader {
    pager: Arc<Pager>,
}

impl CacheLoader<Uid, DataItemHandle> for DmLoader {
    fn get_for_cache(&self, u: Uid) -> Result<DataItemHandle> {
        let (pgno, offset) = uid_parts(u);
        let page = self.pager.get_page(pgno)?;
        Ok(DataItemHandle {
            pgno,
            offset,
            page,
            state: Mutex::new(DiState {
                writer: false,
                readers: 0,
                old_raw: None,
            }),
            cond: Condvar::new(),
        })
    }

    fn release_for_cache(&self, _u: Uid, value: Arc<DataItemHandle>) {
        self.pager.release(value.pgno);
    }
}

pub struct Dm {
    wal: Arc<Wal>,
    page_index: PageIndex,
    cache: RefCache<Uid, DataItemHandle, DmLoader>,
}

const INSERT_RETRIES: usize = 5;

impl Dm {
    /// Opens over `pager`, then scans every existing data page (page 1 is
    /// the validity marker, never a data page) and registers its free space,
    /// so a reopened database reuses the space its last session left behind
    /// instead of only ever allocating new pages.
    pub fn new(pager: Arc<Pager>, wal: Arc<Wal>, capacity: usize) -> Result<Self> {
        let loader = DmLoader {
            pager: Arc::clone(&pager),
        };
        let dm = Self {
            wal,
            page_index: PageIndex::new(),
            cache: RefCache::new(capacity, loader),
        };
        for pgno in 2..=pager.page_count() {
            let raw = pager.read_page_raw(pgno)?;
            dm.register_page(pgno, page::free_space(&raw) as usize);
        }
        Ok(dm)
    }

    /// Registers a page's current free space with the page index.
    fn register_page(&self, pgno: PageNo, free: usize) {
        self.page_index.add(pgno, free);
    }

    /// Wraps `payload`, finds room for it, logs, and writes it. Returns the
    /// new UID.
    pub fn insert(&self, pager: &Pager, xid: Xid, payload: &[u8]) -> Result<Uid> {
        let wrapped = wrap(payload);
        if wrapped.len() > PAGE_SIZE - 2 {
            return Err(EngineError::DataTooLarge);
        }

        for _ in 0..INSERT_RETRIES {
            let pgno = match self.page_index.select(wrapped.len()) {
                Some(pgno) => pgno,
                None => {
                    let new_pgno = pager.new_page(&page::new_ordinary_raw())?;
                    self.page_index.add(new_pgno, PAGE_SIZE - 2);
                    continue;
                }
            };

            let handle = pager.get_page(pgno)?;
            let mut buf = handle.lock();
            if (page::free_space(&buf.data) as usize) < wrapped.len() {
                drop(buf);
                pager.release(pgno);
                continue;
            }
            let offset = page::fso(&buf.data);
            drop(buf);

            self.wal.append(
                &LogRecord::Insert {
                    xid,
                    pgno,
                    offset,
                    raw: wrapped.clone(),
                }
                .encode(),
            )?;

            let mut buf = handle.lock();
            let written_offset = page::insert(&mut buf.data, &wrapped);
            debug_assert_eq!(written_offset, offset);
            buf.dirty = true;
            let free_after = page::free_space(&buf.data);
            drop(buf);
            pager.release(pgno);
            self.page_index.add(pgno, free_after as usize);

            return Ok(uid(pgno, offset));
        }
        Err(EngineError::DatabaseBusy)
    }

    /// Reads the payload at `u`, or `None` if it's tombstoned.
    pub fn read(&self, u: Uid) -> Result<Option<Vec<u8>>> {
        let handle = self.cache.acquire(u)?;
        handle.read_lock();
        let result = {
            let buf = handle.page.lock();
            let start = handle.offset as usize;
            if buf.data[start] == 1 {
                None
            } else {
                let size = bytes_to_u16(&buf.data[start + 1..start + 3]) as usize;
                Some(buf.data[start + 3..start + 3 + size].to_vec())
            }
        };
        handle.read_unlock();
        self.cache.release(u);
        Ok(result)
    }

    /// Write-locks the DataItem, marks its page dirty, and snapshots its
    /// current raw bytes. The caller performs an in-place edit via the
    /// returned guard, then calls `after`/`unbefore`.
    pub fn before(self: &Arc<Self>, u: Uid) -> Result<DataItemGuard> {
        let handle = self.cache.acquire(u)?;
        handle.write_lock();
        let (region_len, old_raw) = {
            let mut buf = handle.page.lock();
            buf.dirty = true;
            let start = handle.offset as usize;
            let size = bytes_to_u16(&buf.data[start + 1..start + 3]) as usize;
            let region_len = 3 + size;
            (region_len, buf.data[start..start + region_len].to_vec())
        };
        handle.state.lock().old_raw = Some(old_raw);
        Ok(DataItemGuard {
            dm: Arc::clone(self),
            uid: u,
            handle,
            region_len,
        })
    }
}

/// Held between `Dm::before` and the guard's consuming `after`/`unbefore`.
pub struct DataItemGuard {
    dm: Arc<Dm>,
    uid: Uid,
    handle: Arc<DataItemHandle>,
    region_len: usize,
}

impl DataItemGuard {
    /// Reads the current value of the item's data payload (post-header).
    pub fn read_data(&self) -> Vec<u8> {
        let buf = self.handle.page.lock();
        let start = self.handle.offset as usize + 3;
        let len = self.region_len - 3;
        buf.data[start..start + len].to_vec()
    }

    /// Overwrites the item's data payload in place. `payload` must be the
    /// same length as the original (updates never resize a DataItem).
    pub fn write_data(&self, payload: &[u8]) {
        debug_assert_eq!(payload.len(), self.region_len - 3);
        let mut buf = self.handle.page.lock();
        let start = self.handle.offset as usize + 3;
        buf.data[start..start + payload.len()].copy_from_slice(payload);
        buf.dirty = true;
    }

    /// Logs the update and releases the write lock.
    pub fn after(self, xid: Xid) -> Result<()> {
        let new_raw = {
            let buf = self.handle.page.lock();
            let start = self.handle.offset as usize;
            buf.data[start..start + self.region_len].to_vec()
        };
        let old_raw = self
            .handle
            .state
            .lock()
            .old_raw
            .take()
            .expect("before() always sets old_raw");
        self.dm.wal.append(
            &LogRecord::Update {
                xid,
                uid: self.uid,
                old_raw,
                new_raw,
            }
            .encode(),
        )?;
        self.handle.write_unlock();
        self.dm.cache.release(self.uid);
        Ok(())
    }

    /// Restores the pre-image and releases the write lock without logging.
    pub fn unbefore(self) {
        let old_raw = self
            .handle
            .state
            .lock()
            .old_raw
            .take()
            .expect("before() always sets old_raw");
        {
            let mut buf = self.handle.page.lock();
            let start = self.handle.offset as usize;
            buf.data[start..start + old_raw.len()].copy_from_slice(&old_raw);
        }
        self.handle.write_unlock();
        self.dm.cache.release(self.uid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page;
    use crate::wal::Wal;
    use tempfile::tempdir;

    fn setup(dir: &tempfile::TempDir) -> (Arc<Pager>, Arc<Dm>) {
        let db = dir.path().join("t.db");
        let log = dir.path().join("t.log");
        let pager = Arc::new(Pager::create(db.to_str().unwrap(), 0).unwrap());
        let wal = Arc::new(Wal::create(log.to_str().unwrap()).unwrap());
        pager.new_page(&page::new_page_one_raw()).unwrap(); // reserve page 1
        let dm = Arc::new(Dm::new(Arc::clone(&pager), wal, 0).unwrap());
        (pager, dm)
    }

    #[test]
    fn uid_matches_pgno_offset_invariant() {
        let dir = tempdir().unwrap();
        let (pager, dm) = setup(&dir);
        let u = dm.insert(&pager, 1, b"hello").unwrap();
        let (pgno, offset) = uid_parts(u);
        assert_eq!(uid(pgno, offset), u);
        assert_eq!(dm.read(u).unwrap().unwrap(), b"hello");
    }

    #[test]
    fn before_after_updates_and_logs() {
        let dir = tempdir().unwrap();
        let (pager, dm) = setup(&dir);
        let u = dm.insert(&pager, 1, b"AAAAA").unwrap();

        let guard = dm.before(u).unwrap();
        guard.write_data(b"BBBBB");
        guard.after(1).unwrap();

        assert_eq!(dm.read(u).unwrap().unwrap(), b"BBBBB");
    }

    #[test]
    fn unbefore_restores_original() {
        let dir = tempdir().unwrap();
        let (pager, dm) = setup(&dir);
        let u = dm.insert(&pager, 1, b"AAAAA").unwrap();

        let guard = dm.before(u).unwrap();
        guard.write_data(b"ZZZZZ");
        guard.unbefore();

        assert_eq!(dm.read(u).unwrap().unwrap(), b"AAAAA");
    }

    #[test]
    fn too_large_payload_rejected() {
        let dir = tempdir().unwrap();
        let (pager, dm) = setup(&dir);
        let payload = vec![0u8; PAGE_SIZE];
        match dm.insert(&pager, 1, &payload) {
            Err(EngineError::DataTooLarge) => {}
            other => panic!("expected DataTooLarge, got {other:?}"),
        }
    }
}
