//! Round-robin cursor.
//!
//! Walks indices into a list using an atomic counter, so selection only
//! needs a shared reference. Lock-free and safe for concurrent access.

use std::sync::atomic::{AtomicUsize, Ordering};

/// A round-robin cursor over a list whose length may change between calls.
///
/// The stored position always stays below the length last passed to
/// [`Cursor::next`]: take the element at the cursor, increment, wrap to 0
/// on reaching the list length.
#[derive(Debug, Default)]
pub struct Cursor {
    position: AtomicUsize,
}

impl Cursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the next index in `0..len`.
    ///
    /// Returns `None` if `len` is zero.
    pub fn next(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let (Ok(previous) | Err(previous)) =
            self.position.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |pos| {
                Some((pos % len + 1) % len)
            });
        Some(previous % len)
    }
}
