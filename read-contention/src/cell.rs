use std::sync::atomic::{AtomicU64, Ordering};

/// A single word that tasks store to and load from.
///
/// The benchmark only needs atomicity of each individual access, but both
/// sides use `SeqCst` so every process sees one total order of its own
/// accesses.
pub trait AtomicWord {
    fn store(&self, value: u64);
    fn load(&self) -> u64;
}

// In-process stand-in for the shared mapping.
impl AtomicWord for AtomicU64 {
    #[inline]
    fn store(&self, value: u64) {
        AtomicU64::store(self, value, Ordering::SeqCst);
    }

    #[inline]
    fn load(&self) -> u64 {
        AtomicU64::load(self, Ordering::SeqCst)
    }
}

impl<T: AtomicWord + ?Sized> AtomicWord for &T {
    #[inline]
    fn store(&self, value: u64) {
        (**self).store(value);
    }

    #[inline]
    fn load(&self) -> u64 {
        (**self).load()
    }
}
