//! Bounded key-value table abstraction
//!
//! Every shared table the probes touch is a fixed-capacity hash map that is
//! read and written concurrently from any CPU without locks. The only
//! mutation discipline available is compare-and-insert on whole records and
//! atomic updates of individual numeric fields.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// How an insert treats an existing entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertMode {
    /// Create or overwrite (`BPF_ANY`)
    Any,
    /// Create only if absent (`BPF_NOEXIST`)
    NoExist,
}

/// Outcome of an insert
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Insert {
    Inserted,
    /// `InsertMode::NoExist` and the key was already present
    Exists,
    /// The table refused the insert, usually because it is full
    Dropped,
}

/// A shared, fixed-capacity table
///
/// `lookup` hands out a raw pointer into the table's storage. It stays valid
/// until the entry is removed; callers must only touch numeric fields through
/// the atomic helpers below when other CPUs may write the same entry.
pub trait Table<K, V> {
    fn lookup(&self, key: &K) -> Option<*mut V>;
    fn insert(&self, key: &K, value: &V, mode: InsertMode) -> Insert;
    fn remove(&self, key: &K);

    #[inline(always)]
    fn contains(&self, key: &K) -> bool {
        self.lookup(key).is_some()
    }
}

/// Atomically add to a `u64` field of a table entry
///
/// # Safety
///
/// `field` must point into a live table entry and be 8-byte aligned.
#[inline(always)]
pub unsafe fn atomic_add_u64(field: *mut u64, value: u64) {
    AtomicU64::from_ptr(field).fetch_add(value, Ordering::Relaxed);
}

/// Atomically add to a `u32` field of a table entry
///
/// # Safety
///
/// `field` must point into a live table entry and be 4-byte aligned.
#[inline(always)]
pub unsafe fn atomic_add_u32(field: *mut u32, value: u32) {
    AtomicU32::from_ptr(field).fetch_add(value, Ordering::Relaxed);
}

/// Overwrite a `u64` field of a table entry without tearing
///
/// # Safety
///
/// Same as [`atomic_add_u64`].
#[inline(always)]
pub unsafe fn atomic_store_u64(field: *mut u64, value: u64) {
    AtomicU64::from_ptr(field).store(value, Ordering::Relaxed);
}

/// Overwrite a `u32` field of a table entry without tearing
///
/// # Safety
///
/// Same as [`atomic_add_u32`].
#[inline(always)]
pub unsafe fn atomic_store_u32(field: *mut u32, value: u32) {
    AtomicU32::from_ptr(field).store(value, Ordering::Relaxed);
}
