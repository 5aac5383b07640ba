//! Facade owning one instance of every subsystem: a single struct wiring
//! together the pieces that would otherwise be ambient process-global
//! state, so multiple engines can coexist in one process.

use std::sync::Arc;

use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::dm::Dm;
use crate::error::Result;
use crate::lock_table::LockTable;
use crate::recovery;
use crate::storage::{page, Pager};
use crate::tm::Tm;
use crate::vm::Vm;
use crate::wal::Wal;

/// One open database (`P.db`/`P.log`/`P.xid`/`P.bt`, sharing the path prefix
/// in `config.path_prefix`). Running recovery, if needed, happens inside
/// [`Engine::open`] before any caller can observe the engine.
pub struct Engine {
    pub catalog: Arc<Catalog>,
    pub vm: Arc<Vm>,
    pub config: EngineConfig,
    pager: Arc<Pager>,
}

impl Engine {
    /// Opens (or creates) the database at `config.path_prefix`, replaying
    /// the WAL if page one's validity marker is stale, then reopens the
    /// catalog's boot chain on top of the now-consistent data file. Page
    /// one's open marker is always restamped before returning, so a crash
    /// during this session is detected as dirty on the next open.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let db_path = format!("{}.db", config.path_prefix);
        let log_path = format!("{}.log", config.path_prefix);
        let xid_path = format!("{}.xid", config.path_prefix);
        let boot_path = format!("{}.bt", config.path_prefix);

        let fresh = !std::path::Path::new(&db_path).exists();

        let pager = Arc::new(if fresh {
            let pager = Pager::create(&db_path, config.page_cache_capacity)?;
            pager.new_page(&page::new_page_one_raw())?;
            pager
        } else {
            Pager::open(&db_path, config.page_cache_capacity)?
        });

        let wal = Arc::new(if fresh {
            Wal::create(&log_path)?
        } else {
            Wal::open(&log_path)?
        });

        let tm = Arc::new(if fresh {
            Tm::create(&xid_path)?
        } else {
            Tm::open(&xid_path)?
        });

        if !fresh {
            if recovery::recover_if_needed(&pager, &wal, &tm)? {
                tracing::info!("recovery completed");
            }
            let mut page_one = pager.read_page_raw(page::PAGE_ONE)?;
            page::stamp_open(&mut page_one);
            pager.flush_page(page::PAGE_ONE, &page_one)?;
        }

        let dm = Arc::new(Dm::new(Arc::clone(&pager), Arc::clone(&wal), config.dm_cache_capacity)?);
        let lock_table = Arc::new(LockTable::new());
        let vm = Arc::new(Vm::new(dm, Arc::clone(&pager), tm, lock_table, config.vm_cache_capacity));
        let catalog = Arc::new(Catalog::open(Arc::clone(&vm), Arc::clone(&pager), boot_path)?);

        Ok(Self { catalog, vm, config, pager })
    }

    /// Stamps page one's close marker so the next open sees a clean shutdown
    /// and skips recovery.
    pub fn close(&self) -> Result<()> {
        let mut page_one = self.pager.read_page_raw(page::PAGE_ONE)?;
        page::stamp_close(&mut page_one);
        self.pager.flush_page(page::PAGE_ONE, &page_one)?;
        self.pager.close();
        Ok(())
    }
}
