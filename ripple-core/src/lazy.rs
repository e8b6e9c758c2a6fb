//! Lazy Construction
//!
//! A cell that defers building its value until the first access. The
//! process-wide singletons (the global runtime, the global FIFO channel and
//! the global task queue) are all stored in one of these so that nothing is
//! allocated for programs that never touch them.
//!
//! The cell can live in a `static`: `Lazy::new` is a `const fn`.

use std::fmt;
use std::ops::Deref;
use std::sync::OnceLock;

use parking_lot::Mutex;

/// A value built on first access.
///
/// # Example
///
/// ```rust
/// use ripple_core::lazy::Lazy;
///
/// static TABLE: Lazy<Vec<u32>> = Lazy::new(|| (0..4).collect());
///
/// assert_eq!(TABLE.len(), 4);
/// ```
pub struct Lazy<T, F = fn() -> T> {
    cell: OnceLock<T>,
    init: Mutex<Option<F>>,
}

impl<T, F> Lazy<T, F>
where
    F: FnOnce() -> T,
{
    /// Create a new lazy cell that will call `init` on first access.
    pub const fn new(init: F) -> Self {
        Self {
            cell: OnceLock::new(),
            init: parking_lot::const_mutex(Some(init)),
        }
    }

    /// Force construction and return a reference to the value.
    ///
    /// Concurrent callers block until the first one finishes building.
    ///
    /// # Panics
    ///
    /// Panics if a previous initializer panicked.
    pub fn force(this: &Self) -> &T {
        this.cell.get_or_init(|| match this.init.lock().take() {
            Some(init) => init(),
            None => panic!("Lazy instance has previously been poisoned"),
        })
    }

    /// Get the value if it has already been built.
    pub fn get(this: &Self) -> Option<&T> {
        this.cell.get()
    }

    /// Check whether the value has been built.
    pub fn is_initialized(this: &Self) -> bool {
        this.cell.get().is_some()
    }
}

impl<T, F> Deref for Lazy<T, F>
where
    F: FnOnce() -> T,
{
    type Target = T;

    fn deref(&self) -> &T {
        Lazy::force(self)
    }
}

impl<T: Default> Default for Lazy<T> {
    fn default() -> Self {
        Lazy::new(T::default)
    }
}

impl<T: fmt::Debug, F> fmt::Debug for Lazy<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cell.get() {
            Some(value) => f.debug_tuple("Lazy").field(value).finish(),
            None => f.write_str("Lazy(<uninit>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn builds_on_first_access_only() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let lazy = Lazy::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            String::from("built")
        });

        assert!(!Lazy::is_initialized(&lazy));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(lazy.as_str(), "built");
        assert_eq!(&*lazy, "built");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Lazy::is_initialized(&lazy));
    }

    #[test]
    fn get_does_not_force() {
        let lazy: Lazy<u32> = Lazy::new(|| 7);
        assert!(Lazy::get(&lazy).is_none());

        assert_eq!(*Lazy::force(&lazy), 7);
        assert_eq!(Lazy::get(&lazy), Some(&7));
    }

    #[test]
    fn works_in_statics() {
        static VALUES: Lazy<Vec<u8>> = Lazy::new(|| vec![1, 2, 3]);
        assert_eq!(VALUES.iter().sum::<u8>(), 6);
    }

    #[test]
    fn default_uses_type_default() {
        let lazy: Lazy<Vec<i32>> = Lazy::default();
        assert!(lazy.is_empty());
    }

    #[test]
    fn debug_shows_state() {
        let lazy: Lazy<u8> = Lazy::new(|| 3);
        assert_eq!(format!("{lazy:?}"), "Lazy(<uninit>)");
        Lazy::force(&lazy);
        assert_eq!(format!("{lazy:?}"), "Lazy(3)");
    }
}
