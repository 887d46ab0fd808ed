//! Guard trigger bypass clause.
//!
//! Guard triggers only fire while the connection-local SQL function
//! `tablesync_guard_bypass()` returns 0. The function reads a flag owned by
//! the executor, so the bypass is scoped to one connection and never
//! persisted in the database file.

use crate::error::CoreResult;
use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Name of the SQL function consulted by guard triggers.
pub const GUARD_BYPASS_FUNCTION: &str = "tablesync_guard_bypass";

/// Shared flag behind the bypass SQL function.
#[derive(Debug, Clone, Default)]
pub struct GuardBypass {
    flag: Arc<AtomicBool>,
}

impl GuardBypass {
    /// Creates a lowered bypass.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the bypass function on a connection.
    ///
    /// Must run before any statement touches a guarded table; a connection
    /// without the function fails every guarded write with "no such function".
    pub fn install(&self, conn: &Connection) -> CoreResult<()> {
        let flag = Arc::clone(&self.flag);
        conn.create_scalar_function(
            GUARD_BYPASS_FUNCTION,
            0,
            FunctionFlags::SQLITE_UTF8,
            move |_ctx| Ok(i64::from(flag.load(Ordering::SeqCst))),
        )?;
        Ok(())
    }

    /// Returns true while the bypass is raised.
    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Raises the bypass until the returned scope is dropped.
    pub fn raise(&self) -> BypassScope<'_> {
        let previous = self.flag.swap(true, Ordering::SeqCst);
        BypassScope {
            bypass: self,
            previous,
        }
    }
}

/// Restores the previous bypass state on drop.
#[must_use = "the bypass is lowered again when the scope is dropped"]
pub struct BypassScope<'a> {
    bypass: &'a GuardBypass,
    previous: bool,
}

impl Drop for BypassScope<'_> {
    fn drop(&mut self) {
        self.bypass.flag.store(self.previous, Ordering::SeqCst);
    }
}
