//! On-disk B+ tree index: fixed-size nodes stored as DataItems, BALANCE=32
//! fan-out, copy-on-split insert, boot item holding the root UID. Recursive
//! insert/split with latch-crabbing drop-then-descend and an
//! `Option<(split_key, new_node)>` bubbling up through the recursion; nodes
//! live as [`crate::dm::Dm`] DataItems and all mutations happen under the
//! super transaction.
//!
//! Node layout: `[isLeaf:1][noKeys:2][sibling:8]` followed by
//! `2*BALANCE` `[son:8][key:8]` slots (unused trailing slots are zeroed).
//! Internal-node entries are resolved as *(son, minimum key reachable
//! through son)*: on split the key bubbled up to the parent is the new
//! node's own first (smallest) key, matching the "parent separator equals
//! the child's minimum" convention flagged in the design notes.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{bytes_to_u16, bytes_to_u64, u16_to_bytes, u64_to_bytes, Uid, SUPER_XID, BALANCE};
use crate::dm::Dm;
use crate::error::{EngineError, Result};
use crate::storage::Pager;

const MAX_ENTRIES: usize = 2 * BALANCE;
const HEADER_LEN: usize = 1 + 2 + 8;
const ENTRY_LEN: usize = 16;
const NODE_LEN: usize = HEADER_LEN + MAX_ENTRIES * ENTRY_LEN;

fn new_node_buf(is_leaf: bool) -> Vec<u8> {
    let mut buf = vec![0u8; NODE_LEN];
    buf[0] = is_leaf as u8;
    buf
}

fn is_leaf(buf: &[u8]) -> bool {
    buf[0] != 0
}

fn no_keys(buf: &[u8]) -> usize {
    bytes_to_u16(&buf[1..3]) as usize
}

fn set_no_keys(buf: &mut [u8], n: usize) {
    buf[1..3].copy_from_slice(&u16_to_bytes(n as u16));
}

fn sibling(buf: &[u8]) -> Uid {
    bytes_to_u64(&buf[3..11])
}

fn set_sibling(buf: &mut [u8], u: Uid) {
    buf[3..11].copy_from_slice(&u64_to_bytes(u));
}

fn entry_offset(i: usize) -> usize {
    HEADER_LEN + i * ENTRY_LEN
}

fn son_at(buf: &[u8], i: usize) -> Uid {
    let o = entry_offset(i);
    bytes_to_u64(&buf[o..o + 8])
}

fn key_at(buf: &[u8], i: usize) -> i64 {
    let o = entry_offset(i);
    i64::from_be_bytes(buf[o + 8..o + 16].try_into().unwrap())
}

fn set_entry(buf: &mut [u8], i: usize, son: Uid, key: i64) {
    let o = entry_offset(i);
    buf[o..o + 8].copy_from_slice(&u64_to_bytes(son));
    buf[o + 8..o + 16].copy_from_slice(&key.to_be_bytes());
}

/// Shifts entries `[at..no_keys)` one slot to the right and writes
/// `(son, key)` at `at`, then bumps `no_keys`.
fn insert_entry_at(buf: &mut [u8], at: usize, son: Uid, key: i64) {
    let n = no_keys(buf);
    for i in (at..n).rev() {
        let s = son_at(buf, i);
        let k = key_at(buf, i);
        set_entry(buf, i + 1, s, k);
    }
    set_entry(buf, at, son, key);
    set_no_keys(buf, n + 1);
}

/// `B+` tree over DataItems. `boot_uid` names the DataItem holding the
/// current root's UID; its own write is serialized by `boot_latch`, matching
/// the "single writer serialized by boot latch" language in the data model.
pub struct Index {
    dm: Arc<Dm>,
    pager: Arc<Pager>,
    boot_uid: Uid,
    boot_latch: Mutex<()>,
}

impl Index {
    /// Creates an empty tree (a single empty leaf root) and its boot item.
    /// Returns the index plus the boot item's UID, which callers persist
    /// (e.g. in a [`crate::catalog`] Field's `indexRootUid`).
    pub fn create(dm: Arc<Dm>, pager: Arc<Pager>) -> Result<(Self, Uid)> {
        let root_buf = new_node_buf(true);
        let root_uid = dm.insert(&pager, SUPER_XID, &root_buf)?;
        let boot_uid = dm.insert(&pager, SUPER_XID, &u64_to_bytes(root_uid))?;
        Ok((
            Self {
                dm,
                pager,
                boot_uid,
                boot_latch: Mutex::new(()),
            },
            boot_uid,
        ))
    }

    /// Reopens a tree given a previously-created boot item UID.
    pub fn open(dm: Arc<Dm>, pager: Arc<Pager>, boot_uid: Uid) -> Self {
        Self {
            dm,
            pager,
            boot_uid,
            boot_latch: Mutex::new(()),
        }
    }

    fn read_root(&self) -> Result<Uid> {
        let raw = self
            .dm
            .read(self.boot_uid)?
            .ok_or(EngineError::InvalidPkgData)?;
        Ok(bytes_to_u64(&raw))
    }

    fn write_root(&self, new_root: Uid) -> Result<()> {
        let _guard = self.boot_latch.lock();
        let item_guard = self.dm.before(self.boot_uid)?;
        item_guard.write_data(&u64_to_bytes(new_root));
        item_guard.after(SUPER_XID)
    }

    /// Point search: at most one UID, since keys are unique in this tree.
    pub fn search(&self, key: i64) -> Result<Vec<Uid>> {
        self.search_range(key, key)
    }

    /// Inclusive range search `[lo, hi]`, ascending by key.
    pub fn search_range(&self, lo: i64, hi: i64) -> Result<Vec<Uid>> {
        let root = self.read_root()?;
        let mut node_uid = self.find_leaf(root, lo)?;
        let mut out = Vec::new();
        loop {
            let buf = self
                .dm
                .read(node_uid)?
                .ok_or(EngineError::InvalidPkgData)?;
            let n = no_keys(&buf);
            let mut reached_end_in_range = false;
            for i in 0..n {
                let k = key_at(&buf, i);
                if k > hi {
                    break;
                }
                if k >= lo {
                    out.push(son_at(&buf, i));
                    if i == n - 1 {
                        reached_end_in_range = true;
                    }
                }
            }
            let sib = sibling(&buf);
            if reached_end_in_range && sib != 0 {
                node_uid = sib;
                continue;
            }
            break;
        }
        Ok(out)
    }

    fn find_leaf(&self, node_uid: Uid, key: i64) -> Result<Uid> {
        let buf = self.dm.read(node_uid)?.ok_or(EngineError::InvalidPkgData)?;
        if is_leaf(&buf) {
            return Ok(node_uid);
        }
        let (son, _) = self.find_child(node_uid, key)?;
        self.find_leaf(son, key)
    }

    /// Descends from `node_uid`, walking right siblings if this node's own
    /// view is stale (a safety net for concurrent splits). Returns
    /// `(son_uid, node_uid_actually_used)`.
    fn find_child(&self, node_uid: Uid, key: i64) -> Result<(Uid, Uid)> {
        let mut cur = node_uid;
        loop {
            let buf = self.dm.read(cur)?.ok_or(EngineError::InvalidPkgData)?;
            let n = no_keys(&buf);
            if n == 0 {
                return Err(EngineError::InvalidPkgData);
            }
            // Last entry whose key <= target; clamp to the first entry if
            // target is smaller than everything here.
            let mut idx = 0;
            for i in 0..n {
                if key_at(&buf, i) <= key {
                    idx = i;
                } else {
                    break;
                }
            }
            let sib = sibling(&buf);
            if idx == n - 1 && sib != 0 {
                let sib_buf = self.dm.read(sib)?.ok_or(EngineError::InvalidPkgData)?;
                if no_keys(&sib_buf) > 0 && key_at(&sib_buf, 0) <= key {
                    cur = sib;
                    continue;
                }
            }
            return Ok((son_at(&buf, idx), cur));
        }
    }

    /// Inserts `key -> uid`. All mutations run under the super XID.
    pub fn insert(&self, key: i64, uid: Uid) -> Result<()> {
        let root = self.read_root()?;
        if let Some((new_sibling_uid, new_key)) = self.insert_into(root, key, uid)? {
            self.promote_root(root, new_sibling_uid, new_key)?;
        }
        Ok(())
    }

    fn promote_root(&self, old_root: Uid, new_sibling: Uid, new_key: i64) -> Result<()> {
        let mut buf = new_node_buf(false);
        let old_root_min = {
            let old_buf = self.dm.read(old_root)?.ok_or(EngineError::InvalidPkgData)?;
            if no_keys(&old_buf) > 0 {
                key_at(&old_buf, 0)
            } else {
                i64::MIN
            }
        };
        set_entry(&mut buf, 0, old_root, old_root_min);
        set_entry(&mut buf, 1, new_sibling, new_key);
        set_no_keys(&mut buf, 2);
        let new_root_uid = self.dm.insert(&self.pager, SUPER_XID, &buf)?;
        self.write_root(new_root_uid)
    }

    /// Recursively inserts into the subtree rooted at `node_uid`. On a split,
    /// returns `(new_node_uid, new_node's minimum key)` for the caller to
    /// insert into its own parent (or promote to a new root).
    fn insert_into(&self, node_uid: Uid, key: i64, uid: Uid) -> Result<Option<(Uid, i64)>> {
        let peek = self.dm.read(node_uid)?.ok_or(EngineError::InvalidPkgData)?;
        if is_leaf(&peek) {
            self.insert_into_leaf(node_uid, key, uid)
        } else {
            let (child, via_uid) = self.find_child(node_uid, key)?;
            let split = self.insert_into(child, key, uid)?;
            match split {
                Some((new_child_uid, new_key)) => self.insert_separator(via_uid, new_child_uid, new_key),
                None => Ok(None),
            }
        }
    }

    fn insert_into_leaf(&self, leaf_uid: Uid, key: i64, uid: Uid) -> Result<Option<(Uid, i64)>> {
        // Defer to the right sibling if a concurrent split moved our
        // responsibility for this key away already.
        let peek = self.dm.read(leaf_uid)?.ok_or(EngineError::InvalidPkgData)?;
        let n = no_keys(&peek);
        let sib = sibling(&peek);
        if n > 0 && key > key_at(&peek, n - 1) && sib != 0 {
            return self.insert_into_leaf(sib, key, uid);
        }

        let guard = self.dm.before(leaf_uid)?;
        let mut buf = guard.read_data();
        let n = no_keys(&buf);
        let mut at = n;
        for i in 0..n {
            if key_at(&buf, i) >= key {
                at = i;
                break;
            }
        }
        insert_entry_at(&mut buf, at, uid, key);

        let result = if no_keys(&buf) == MAX_ENTRIES {
            let original_sibling = sibling(&buf);
            let mut new_buf = new_node_buf(true);
            for (new_i, old_i) in (BALANCE..MAX_ENTRIES).enumerate() {
                set_entry(&mut new_buf, new_i, son_at(&buf, old_i), key_at(&buf, old_i));
            }
            set_no_keys(&mut new_buf, BALANCE);
            set_sibling(&mut new_buf, original_sibling);
            let new_key = key_at(&new_buf, 0);
            let new_leaf_uid = self.dm.insert(&self.pager, SUPER_XID, &new_buf)?;

            set_no_keys(&mut buf, BALANCE);
            set_sibling(&mut buf, new_leaf_uid);
            Some((new_leaf_uid, new_key))
        } else {
            None
        };

        guard.write_data(&buf);
        guard.after(SUPER_XID)?;
        Ok(result)
    }

    fn insert_separator(&self, node_uid: Uid, son: Uid, key: i64) -> Result<Option<(Uid, i64)>> {
        let guard = self.dm.before(node_uid)?;
        let mut buf = guard.read_data();
        let n = no_keys(&buf);
        let mut at = n;
        for i in 0..n {
            if key_at(&buf, i) >= key {
                at = i;
                break;
            }
        }
        insert_entry_at(&mut buf, at, son, key);

        let result = if no_keys(&buf) == MAX_ENTRIES {
            let original_sibling = sibling(&buf);
            let mut new_buf = new_node_buf(false);
            for (new_i, old_i) in (BALANCE..MAX_ENTRIES).enumerate() {
                set_entry(&mut new_buf, new_i, son_at(&buf, old_i), key_at(&buf, old_i));
            }
            set_no_keys(&mut new_buf, BALANCE);
            set_sibling(&mut new_buf, original_sibling);
            let new_key = key_at(&new_buf, 0);
            let new_node_uid = self.dm.insert(&self.pager, SUPER_XID, &new_buf)?;

            set_no_keys(&mut buf, BALANCE);
            set_sibling(&mut buf, new_node_uid);
            Some((new_node_uid, new_key))
        } else {
            None
        };

        guard.write_data(&buf);
        guard.after(SUPER_XID)?;
        Ok(result)
    }
}
