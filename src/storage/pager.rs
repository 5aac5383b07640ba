//! Page cache: fixed 8 KiB pages backed by a single data file, addressed
//! through the generic [`crate::cache::RefCache`], with a plain
//! seek/read-at-offset disk access pattern underneath.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::{CacheLoader, RefCache};
use crate::common::PageNo;
use crate::common::PAGE_SIZE;
use crate::error::{fatal, Result};

pub struct PageBuf {
    pub pgno: PageNo,
    pub data: Vec<u8>,
    pub dirty: bool,
}

/// A resident page: the cache hands out `Arc<PageHandle>`s; callers lock the
/// inner mutex to read or mutate bytes.
pub type PageHandle = Mutex<PageBuf>;

struct PagerLoader {
    file: Arc<Mutex<File>>,
}

impl CacheLoader<PageNo, PageHandle> for PagerLoader {
    fn get_for_cache(&self, pgno: PageNo) -> Result<PageHandle> {
        let mut file = self.file.lock();
        let mut data = vec![0u8; PAGE_SIZE];
        file.seek(SeekFrom::Start(offset_of(pgno)))?;
        file.read_exact(&mut data)?;
        Ok(Mutex::new(PageBuf {
            pgno,
            data,
            dirty: false,
        }))
    }

    fn release_for_cache(&self, pgno: PageNo, value: Arc<PageHandle>) {
        let buf = value.lock();
        if !buf.dirty {
            return;
        }
        let mut file = self.file.lock();
        if let Err(e) = file.seek(SeekFrom::Start(offset_of(pgno))) {
            fatal(format!("page write-back seek failed: {e}"));
        }
        if let Err(e) = file.write_all(&buf.data) {
            fatal(format!("page write-back failed: {e}"));
        }
    }
}

fn offset_of(pgno: PageNo) -> u64 {
    (pgno as u64 - 1) * PAGE_SIZE as u64
}

pub struct Pager {
    file: Arc<Mutex<File>>,
    page_count: AtomicU32,
    cache: RefCache<PageNo, PageHandle, PagerLoader>,
}

impl Pager {
    pub fn create(path: &str, capacity: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::from_file(file, capacity)
    }

    pub fn open(path: &str, capacity: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_file(file, capacity)
    }

    fn from_file(file: File, capacity: usize) -> Result<Self> {
        let len = file.metadata()?.len();
        let page_count = (len / PAGE_SIZE as u64) as u32;
        let file = Arc::new(Mutex::new(file));
        let loader = PagerLoader {
            file: Arc::clone(&file),
        };
        Ok(Self {
            file,
            page_count: AtomicU32::new(page_count),
            cache: RefCache::new(capacity, loader),
        })
    }

    /// Appends a new page, flushing it immediately, and returns its number.
    pub fn new_page(&self, init: &[u8]) -> Result<PageNo> {
        debug_assert_eq!(init.len(), PAGE_SIZE);
        let pgno = self.page_count.fetch_add(1, Ordering::SeqCst) + 1;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset_of(pgno)))?;
        file.write_all(init)?;
        file.sync_all()?;
        Ok(pgno)
    }

    pub fn get_page(&self, pgno: PageNo) -> Result<Arc<PageHandle>> {
        self.cache.acquire(pgno)
    }

    pub fn release(&self, pgno: PageNo) {
        self.cache.release(pgno);
    }

    pub fn page_count(&self) -> PageNo {
        self.page_count.load(Ordering::SeqCst)
    }

    /// Sets the file length to `m` pages and resets the page counter. Only
    /// used by recovery, before any replay and with the cache empty.
    pub fn truncate_by_pgno(&self, m: PageNo) -> Result<()> {
        let file = self.file.lock();
        file.set_len(offset_of(m + 1))?;
        drop(file);
        self.page_count.store(m, Ordering::SeqCst);
        Ok(())
    }

    pub fn flush_page(&self, pgno: PageNo, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset_of(pgno)))?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn read_page_raw(&self, pgno: PageNo) -> Result<Vec<u8>> {
        let mut file = self.file.lock();
        let mut data = vec![0u8; PAGE_SIZE];
        file.seek(SeekFrom::Start(offset_of(pgno)))?;
        file.read_exact(&mut data)?;
        Ok(data)
    }

    pub fn close(&self) {
        self.cache.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page;
    use tempfile::tempdir;

    #[test]
    fn new_page_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let pager = Pager::create(path.to_str().unwrap(), 0).unwrap();

        let mut raw = page::new_ordinary_raw();
        page::insert(&mut raw, b"hi");
        let pgno = pager.new_page(&raw).unwrap();
        assert_eq!(pgno, 1);

        let handle = pager.get_page(pgno).unwrap();
        {
            let buf = handle.lock();
            assert_eq!(&buf.data[2..4], b"hi");
        }
        pager.release(pgno);
    }

    #[test]
    fn dirty_page_written_back_on_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.db");
        let pager = Pager::create(path.to_str().unwrap(), 0).unwrap();
        let raw = page::new_ordinary_raw();
        let pgno = pager.new_page(&raw).unwrap();

        let handle = pager.get_page(pgno).unwrap();
        {
            let mut buf = handle.lock();
            page::insert(&mut buf.data, b"world");
            buf.dirty = true;
        }
        pager.release(pgno);

        let on_disk = pager.read_page_raw(pgno).unwrap();
        assert_eq!(&on_disk[2..7], b"world");
    }
}
