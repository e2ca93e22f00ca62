//! The single-write cell a job places its output in.
//!
//! A `ResultSlot` is shared between the job's closure (the only writer) and
//! every clone of the `Task` handle (readers). Readers must first observe the
//! job as executed: the executed flag is published with release ordering after
//! the write, so once a reader sees it the value is visible.

use std::sync::OnceLock;

/// A thread-safe slot where a job's output is placed exactly once.
pub struct ResultSlot<T> {
    cell: OnceLock<T>,
}

impl<T> ResultSlot<T> {
    /// Create an empty slot.
    #[inline]
    pub fn new() -> Self {
        ResultSlot {
            cell: OnceLock::new(),
        }
    }

    /// Place data in the slot.
    ///
    /// Only the owning job's closure calls this, and it runs at most once.
    #[inline]
    pub fn set(&self, payload: T) {
        let res = self.cell.set(payload);
        debug_assert!(res.is_ok(), "result slot written twice");
    }

    /// Get a reference on the data, if it was set.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        self.cell.get()
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl<T> Default for ResultSlot<T> {
    fn default() -> Self {
        ResultSlot::new()
    }
}

#[test]
fn test_slot_set_once() {
    let slot = ResultSlot::new();
    assert!(!slot.is_set());
    assert_eq!(slot.get(), None);

    slot.set(String::from("done"));
    assert!(slot.is_set());
    assert_eq!(slot.get().map(String::as_str), Some("done"));
}
