//! Crash recovery: redo committed/aborted-irrelevant work, then undo
//! whatever was still active at crash time, bucketing WAL records per XID
//! before the undo pass.

use std::collections::HashMap;

use crate::common::{PageNo, Xid};
use crate::error::Result;
use crate::storage::{page, Pager};
use crate::tm::Tm;
use crate::wal::{LogRecord, Wal};

/// Runs recovery if needed. Returns `true` if recovery actually ran (page
/// one's validity marker was stale).
pub fn recover_if_needed(pager: &Pager, wal: &Wal, tm: &Tm) -> Result<bool> {
    let page_one = pager.read_page_raw(page::PAGE_ONE)?;
    if page::check_vc(&page_one) {
        return Ok(false);
    }
    tracing::warn!("page one validity marker stale, running recovery");
    run_recovery(pager, wal, tm)?;
    Ok(true)
}

fn run_recovery(pager: &Pager, wal: &Wal, tm: &Tm) -> Result<()> {
    let bodies = wal.scan_all()?;
    let records: Vec<LogRecord> = bodies
        .iter()
        .map(|b| LogRecord::decode(b))
        .collect::<Result<_>>()?;

    let max_pgno: PageNo = records
        .iter()
        .map(|r| r.pgno_touched())
        .max()
        .unwrap_or(1)
        .max(1);
    pager.truncate_by_pgno(max_pgno)?;

    redo_pass(pager, tm, &records)?;
    undo_pass(pager, tm, &records)?;
    Ok(())
}

fn redo_pass(pager: &Pager, tm: &Tm, records: &[LogRecord]) -> Result<()> {
    for record in records {
        if !tm.is_active(record.xid()) {
            apply(pager, record, Direction::Redo)?;
        }
    }
    Ok(())
}

fn undo_pass(pager: &Pager, tm: &Tm, records: &[LogRecord]) -> Result<()> {
    let mut per_xid: HashMap<Xid, Vec<&LogRecord>> = HashMap::new();
    for record in records {
        if tm.is_active(record.xid()) {
            per_xid.entry(record.xid()).or_default().push(record);
        }
    }
    for (xid, recs) in per_xid {
        for record in recs.iter().rev() {
            apply(pager, record, Direction::Undo)?;
        }
        tm.abort(xid)?;
    }
    Ok(())
}

enum Direction {
    Redo,
    Undo,
}

fn apply(pager: &Pager, record: &LogRecord, direction: Direction) -> Result<()> {
    match (record, direction) {
        (LogRecord::Insert { pgno, offset, raw, .. }, Direction::Redo) => {
            let handle = pager.get_page(*pgno)?;
            {
                let mut buf = handle.lock();
                page::recover_insert(&mut buf.data, *offset, raw);
                buf.dirty = true;
            }
            pager.release(*pgno);
        }
        (LogRecord::Insert { pgno, offset, .. }, Direction::Undo) => {
            let handle = pager.get_page(*pgno)?;
            {
                let mut buf = handle.lock();
                page::recover_update(&mut buf.data, *offset, &[1]);
                buf.dirty = true;
            }
            pager.release(*pgno);
        }
        (LogRecord::Update { uid, new_raw, .. }, Direction::Redo) => {
            let pgno = (*uid >> 32) as PageNo;
            let offset = (*uid & 0xffff) as u16;
            let handle = pager.get_page(pgno)?;
            {
                let mut buf = handle.lock();
                page::recover_update(&mut buf.data, offset, new_raw);
                buf.dirty = true;
            }
            pager.release(pgno);
        }
        (LogRecord::Update { uid, old_raw, .. }, Direction::Undo) => {
            let pgno = (*uid >> 32) as PageNo;
            let offset = (*uid & 0xffff) as u16;
            let handle = pager.get_page(pgno)?;
            {
                let mut buf = handle.lock();
                page::recover_update(&mut buf.data, offset, old_raw);
                buf.dirty = true;
            }
            pager.release(pgno);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page;
    use tempfile::tempdir;

    fn p(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_str().unwrap().to_string()
    }

    #[test]
    fn redo_applies_committed_inserts_and_undo_removes_active_ones() {
        let dir = tempdir().unwrap();
        let db_path = p(&dir, "t.db");
        let log_path = p(&dir, "t.log");
        let xid_path = p(&dir, "t.xid");

        let pager = Pager::create(&db_path, 0).unwrap();
        let wal = Wal::create(&log_path).unwrap();
        let tm = Tm::create(&xid_path).unwrap();

        // Page one.
        pager.new_page(&page::new_page_one_raw()).unwrap();
        // A data page.
        let pgno = pager.new_page(&page::new_ordinary_raw()).unwrap();

        let committed_xid = tm.begin().unwrap();
        let raw_committed = vec![0u8, 0, 3, b'a', b'b', b'c'];
        let handle = pager.get_page(pgno).unwrap();
        let offset_committed = {
            let mut buf = handle.lock();
            page::insert(&mut buf.data, &raw_committed)
        };
        pager.release(pgno);
        wal.append(
            &LogRecord::Insert {
                xid: committed_xid,
                pgno,
                offset: offset_committed,
                raw: raw_committed.clone(),
            }
            .encode(),
        )
        .unwrap();
        tm.commit(committed_xid).unwrap();

        let active_xid = tm.begin().unwrap();
        let raw_active = vec![0u8, 0, 3, b'x', b'y', b'z'];
        let handle = pager.get_page(pgno).unwrap();
        let offset_active = {
            let mut buf = handle.lock();
            page::insert(&mut buf.data, &raw_active)
        };
        pager.release(pgno);
        wal.append(
            &LogRecord::Insert {
                xid: active_xid,
                pgno,
                offset: offset_active,
                raw: raw_active.clone(),
            }
            .encode(),
        )
        .unwrap();
        // active_xid is never committed: simulates a crash.

        // Simulate a crash: blow away the page cache's view by reopening the pager.
        pager.close();
        drop(pager);
        let pager = Pager::open(&db_path, 0).unwrap();

        let ran = recover_if_needed(&pager, &wal, &tm).unwrap();
        assert!(ran);

        let page_data = pager.read_page_raw(pgno).unwrap();
        // Committed insert's data survived.
        assert_eq!(
            &page_data[offset_committed as usize..offset_committed as usize + raw_committed.len()],
            &raw_committed[..]
        );
        // Active insert's valid byte was tombstoned (set to 1).
        assert_eq!(page_data[offset_active as usize], 1);
        assert!(tm.is_aborted(active_xid));
    }
}
