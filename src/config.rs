//! Engine-wide configuration.

use crate::vm::IsolationLevel;

/// Tunables for opening an [`crate::engine::Engine`].
///
/// Keeps what would otherwise be process-global state (XID counter file
/// path, boot file path, active-transaction map) as fields owned by one
/// value, so several engines can coexist in a process — this is what the
/// test suite does, each given its own `tempfile::tempdir()`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Common path prefix `P`; files are `P.db`, `P.log`, `P.xid`, `P.bt`.
    pub path_prefix: String,
    /// Page cache capacity in pages; 0 means unbounded.
    pub page_cache_capacity: usize,
    /// DataItem cache capacity in items; 0 means unbounded.
    pub dm_cache_capacity: usize,
    /// Entry cache capacity in items; 0 means unbounded.
    pub vm_cache_capacity: usize,
    /// Isolation level used when a transaction doesn't specify one.
    pub default_isolation: IsolationLevel,
}

impl EngineConfig {
    pub fn new(path_prefix: impl Into<String>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            ..Default::default()
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path_prefix: "./ferrodb".to_string(),
            page_cache_capacity: 0,
            dm_cache_capacity: 0,
            vm_cache_capacity: 0,
            default_isolation: IsolationLevel::ReadCommitted,
        }
    }
}
