//! Version manager / MVCC: an `Arc<RwLock<HashMap<..>>>` active-transaction
//! table backing XMIN/XMAX tuple versioning, Read Committed and Repeatable
//! Read visibility, and version-skip detection for RR writers. Raw entries
//! are memoized by UID through [`crate::cache::RefCache`], the same
//! abstraction backing the page cache and DM.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::{CacheLoader, RefCache};
use crate::common::{bytes_to_u64, u64_to_bytes, Uid, Xid};
use crate::dm::Dm;
use crate::error::{EngineError, Result};
use crate::lock_table::LockTable;
use crate::storage::Pager;
use crate::tm::Tm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted = 0,
    RepeatableRead = 1,
}

/// A transaction's VM-level bookkeeping: its snapshot (RR only), the
/// sticky error that forces auto-abort, and whether that auto-abort has
/// already happened (so an explicit `abort` from the caller is a no-op).
#[derive(Clone)]
pub struct Transaction {
    pub xid: Xid,
    pub level: IsolationLevel,
    pub snapshot: HashSet<Xid>,
    pub err: Option<EngineError>,
    pub auto_aborted: bool,
}

fn encode_entry(xmin: Xid, xmax: Xid, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + payload.len());
    out.extend_from_slice(&u64_to_bytes(xmin));
    out.extend_from_slice(&u64_to_bytes(xmax));
    out.extend_from_slice(payload);
    out
}

fn decode_entry(raw: &[u8]) -> (Xid, Xid, &[u8]) {
    let xmin = bytes_to_u64(&raw[0..8]);
    let xmax = bytes_to_u64(&raw[8..16]);
    (xmin, xmax, &raw[16..])
}

/// The super transaction is implicitly committed by convention wherever
/// visibility is checked, even though `Tm::is_committed(SUPER_XID)` itself
/// returns `false` (it's never actually recorded in the XID file).
fn tm_committed(tm: &Tm, x: Xid) -> bool {
    x == crate::common::SUPER_XID || tm.is_committed(x)
}

fn is_visible(tx: &Transaction, tm: &Tm, xmin: Xid, xmax: Xid) -> bool {
    let committed = |x: Xid| tm_committed(tm, x);
    match tx.level {
        IsolationLevel::ReadCommitted => {
            (xmin == tx.xid && xmax == 0)
                || (committed(xmin) && (xmax == 0 || (xmax != tx.xid && !committed(xmax))))
        }
        IsolationLevel::RepeatableRead => {
            (xmin == tx.xid && xmax == 0)
                || (committed(xmin)
                    && xmin < tx.xid
                    && !tx.snapshot.contains(&xmin)
                    && (xmax == 0
                        || (xmax != tx.xid
                            && (!committed(xmax) || xmax > tx.xid || tx.snapshot.contains(&xmax)))))
        }
    }
}

/// True iff proceeding with a write under RR would silently skip a version
/// this transaction should have seen.
fn is_version_skip(tx: &Transaction, tm: &Tm, xmax: Xid) -> bool {
    if tx.level != IsolationLevel::RepeatableRead || xmax == 0 {
        return false;
    }
    tm_committed(tm, xmax) && (xmax > tx.xid || tx.snapshot.contains(&xmax))
}

struct EntryLoader {
    dm: Arc<Dm>,
}

impl CacheLoader<Uid, Vec<u8>> for EntryLoader {
    fn get_for_cache(&self, uid: Uid) -> Result<Vec<u8>> {
        self.dm.read(uid)?.ok_or(EngineError::NullEntry)
    }

    fn release_for_cache(&self, _uid: Uid, _value: Arc<Vec<u8>>) {}
}

pub struct Vm {
    dm: Arc<Dm>,
    pager: Arc<Pager>,
    tm: Arc<Tm>,
    lock_table: Arc<LockTable>,
    active: Mutex<HashMap<Xid, Arc<Mutex<Transaction>>>>,
    entries: RefCache<Uid, Vec<u8>, EntryLoader>,
}

impl Vm {
    pub fn new(
        dm: Arc<Dm>,
        pager: Arc<Pager>,
        tm: Arc<Tm>,
        lock_table: Arc<LockTable>,
        entry_cache_capacity: usize,
    ) -> Self {
        let loader = EntryLoader { dm: Arc::clone(&dm) };
        Self {
            dm,
            pager,
            tm,
            lock_table,
            active: Mutex::new(HashMap::new()),
            entries: RefCache::new(entry_cache_capacity, loader),
        }
    }

    /// Reads the raw XMIN/XMAX/payload entry at `uid` through the Entry
    /// cache, memoizing concurrent reads of the same uid. `None` means the
    /// underlying DataItem was physically tombstoned (recovery undo of an
    /// insert), not an MVCC delete.
    fn read_entry(&self, uid: Uid) -> Result<Option<Vec<u8>>> {
        match self.entries.acquire(uid) {
            Ok(arc) => {
                let raw = (*arc).clone();
                self.entries.release(uid);
                Ok(Some(raw))
            }
            Err(EngineError::NullEntry) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn begin(&self, level: IsolationLevel) -> Result<Xid> {
        let xid = self.tm.begin()?;
        let mut active = self.active.lock();
        let snapshot = if level == IsolationLevel::RepeatableRead {
            active.keys().copied().collect()
        } else {
            HashSet::new()
        };
        active.insert(
            xid,
            Arc::new(Mutex::new(Transaction {
                xid,
                level,
                snapshot,
                err: None,
                auto_aborted: false,
            })),
        );
        tracing::debug!(xid, ?level, "vm transaction begin");
        Ok(xid)
    }

    fn get_transaction(&self, xid: Xid) -> Option<Arc<Mutex<Transaction>>> {
        self.active.lock().get(&xid).cloned()
    }

    /// Hands out the underlying [`Dm`], for callers (the catalog, the B+
    /// tree) that need direct page-level access for metadata and index nodes
    /// that live outside MVCC's XMIN/XMAX versioning.
    pub fn dm_handle(&self) -> Arc<Dm> {
        Arc::clone(&self.dm)
    }

    /// A transparent Read-Committed view used for the super transaction: the
    /// catalog and B+ tree read/write metadata "through VM" under XID 0,
    /// which never goes through `begin()`.
    fn super_transaction() -> Transaction {
        Transaction {
            xid: crate::common::SUPER_XID,
            level: IsolationLevel::ReadCommitted,
            snapshot: HashSet::new(),
            err: None,
            auto_aborted: false,
        }
    }

    pub fn read(&self, xid: Xid, uid: Uid) -> Result<Option<Vec<u8>>> {
        let tx = if xid == crate::common::SUPER_XID {
            Self::super_transaction()
        } else {
            let tx_handle = self
                .get_transaction(xid)
                .ok_or(EngineError::NoTransaction)?;
            let locked = tx_handle.lock();
            if let Some(err) = &locked.err {
                return Err(err.clone());
            }
            locked.clone()
        };
        let raw = match self.read_entry(uid)? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let (xmin, xmax, payload) = decode_entry(&raw);
        if is_visible(&tx, &self.tm, xmin, xmax) {
            Ok(Some(payload.to_vec()))
        } else {
            Ok(None)
        }
    }

    pub fn insert(&self, xid: Xid, data: &[u8]) -> Result<Uid> {
        if xid != crate::common::SUPER_XID {
            let tx_handle = self
                .get_transaction(xid)
                .ok_or(EngineError::NoTransaction)?;
            let tx = tx_handle.lock();
            if let Some(err) = &tx.err {
                return Err(err.clone());
            }
        }
        let entry = encode_entry(xid, 0, data);
        self.dm.insert(&self.pager, xid, &entry)
    }

    pub fn delete(&self, xid: Xid, uid: Uid) -> Result<bool> {
        let tx_handle = if xid == crate::common::SUPER_XID {
            None
        } else {
            let tx_handle = self
                .get_transaction(xid)
                .ok_or(EngineError::NoTransaction)?;
            if let Some(err) = &tx_handle.lock().err {
                return Err(err.clone());
            }
            Some(tx_handle)
        };
        let current_tx = |tx_handle: &Option<Arc<Mutex<Transaction>>>| match tx_handle {
            Some(h) => h.lock().clone(),
            None => Self::super_transaction(),
        };

        let raw = match self.read_entry(uid)? {
            Some(raw) => raw,
            None => return Ok(false),
        };
        {
            let tx = current_tx(&tx_handle);
            let (xmin, xmax, _) = decode_entry(&raw);
            if !is_visible(&tx, &self.tm, xmin, xmax) {
                return Ok(false);
            }
        }

        match self.lock_table.add(xid, uid) {
            Ok(None) => {}
            Ok(Some(latch)) => latch.wait(),
            Err(EngineError::Deadlock) => {
                self.auto_abort(xid, EngineError::ConcurrentUpdate);
                return Err(EngineError::ConcurrentUpdate);
            }
            Err(e) => return Err(e),
        }

        let raw = match self.dm.read(uid)? {
            Some(raw) => raw,
            None => return Ok(false),
        };
        let (_, xmax, _) = decode_entry(&raw);
        if xmax == xid {
            return Ok(false);
        }

        {
            let tx = current_tx(&tx_handle);
            if is_version_skip(&tx, &self.tm, xmax) {
                self.auto_abort(xid, EngineError::ConcurrentUpdate);
                return Err(EngineError::ConcurrentUpdate);
            }
        }

        let guard = self.dm.before(uid)?;
        let mut bytes = guard.read_data();
        bytes[8..16].copy_from_slice(&u64_to_bytes(xid));
        guard.write_data(&bytes);
        guard.after(xid)?;
        self.entries.invalidate(uid);
        Ok(true)
    }

    /// Sets `err`, flags `auto_aborted`, and tears down the transaction's
    /// lock-table/TM state immediately, so a later explicit `abort` from the
    /// caller becomes a no-op (the transaction is already gone).
    fn auto_abort(&self, xid: Xid, err: EngineError) {
        if let Some(tx_handle) = self.active.lock().remove(&xid) {
            let mut tx = tx_handle.lock();
            tx.err = Some(err);
            tx.auto_aborted = true;
        }
        self.lock_table.remove(xid);
        if self.tm.is_active(xid) {
            let _ = self.tm.abort(xid);
        }
        tracing::debug!(xid, "vm transaction auto-aborted");
    }

    pub fn commit(&self, xid: Xid) -> Result<()> {
        if self.active.lock().remove(&xid).is_none() {
            return Ok(()); // already auto-aborted
        }
        self.lock_table.remove(xid);
        self.tm.commit(xid)?;
        tracing::debug!(xid, "vm transaction commit");
        Ok(())
    }

    pub fn abort(&self, xid: Xid) -> Result<()> {
        if self.active.lock().remove(&xid).is_none() {
            return Ok(()); // already auto-aborted
        }
        self.lock_table.remove(xid);
        self.tm.abort(xid)?;
        tracing::debug!(xid, "vm transaction abort");
        Ok(())
    }
}
