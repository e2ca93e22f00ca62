pub use std::sync::atomic::Ordering;
pub use std::sync::{LockResult, PoisonError};

#[cfg(not(loom))] pub use std::{
    sync::{
        Arc, Mutex, MutexGuard, Condvar, RwLock,
        atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize},
    },
    thread,
};


#[cfg(loom)] pub use loom::{
    sync::{
        Arc, Mutex, MutexGuard, Condvar, RwLock,
        atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize},
    },
    thread
};

/// None of our critical sections run user code, so a poisoned lock still
/// protects consistent data.
#[inline]
pub fn unpoison<G>(result: LockResult<G>) -> G {
    result.unwrap_or_else(PoisonError::into_inner)
}
