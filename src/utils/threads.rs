//! Thread-count and lock primitives used by the training loops
//!
//! A small compatibility layer over `rayon` and `parking_lot`: the trainers
//! ask [`max_threads`] how wide to fan out and run their parallel sections
//! through [`install`]. [`Lock`] guards state shared between workers.

use crate::Result;
use parking_lot::{Mutex, MutexGuard};
use rayon::ThreadPool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Requested worker count, 0 means "use all cores"
static NUM_THREADS: AtomicUsize = AtomicUsize::new(0);

/// Pools built so far, one per requested size
static POOLS: Mutex<Vec<(usize, Arc<ThreadPool>)>> = Mutex::new(Vec::new());

/// Set the number of worker threads used by subsequent parallel sections
///
/// Passing 0 restores the default (one thread per logical core).
pub fn set_num_threads(num_threads: usize) {
    NUM_THREADS.store(num_threads, Ordering::Relaxed);
}

/// Maximum number of worker threads a parallel section may use
pub fn max_threads() -> usize {
    match NUM_THREADS.load(Ordering::Relaxed) {
        0 => num_cpus::get().max(1),
        n => n,
    }
}

/// Index of the calling worker thread inside its pool (0 outside a pool)
pub fn thread_index() -> usize {
    rayon::current_thread_index().unwrap_or(0)
}

/// Run `f` on a pool sized by [`max_threads`]
///
/// When the current pool already has the requested size `f` runs directly,
/// so nested calls do not spawn extra pools. Other sizes are built once and
/// reused by later calls.
pub fn install<F, R>(f: F) -> Result<R>
where
    F: FnOnce() -> R + Send,
    R: Send,
{
    let wanted = max_threads();
    if wanted == rayon::current_num_threads() {
        return Ok(f());
    }

    let pool = pool_with_size(wanted)?;
    Ok(pool.install(f))
}

fn pool_with_size(num_threads: usize) -> Result<Arc<ThreadPool>> {
    let mut pools = POOLS.lock();
    if let Some((_, pool)) = pools.iter().find(|(size, _)| *size == num_threads) {
        return Ok(Arc::clone(pool));
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build thread pool with {} threads: {}", num_threads, e))?;
    let pool = Arc::new(pool);
    log::debug!("Built worker pool with {} threads", num_threads);
    pools.push((num_threads, Arc::clone(&pool)));
    Ok(pool)
}

/// Mutual-exclusion lock around a value shared by parallel workers
#[derive(Debug, Default)]
pub struct Lock<T> {
    inner: Mutex<T>,
}

impl<T> Lock<T> {
    /// Initialize the lock with `value`
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Block until the lock is held; it is released when the guard drops
    pub fn acquire(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    /// Release a held lock explicitly
    pub fn release(guard: MutexGuard<'_, T>) {
        drop(guard);
    }

    /// Consume the lock and return the protected value
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn test_max_threads_positive() {
        assert!(max_threads() >= 1);
    }

    #[test]
    fn test_install_runs_closure() {
        let sum = install(|| (0..100u64).into_par_iter().sum::<u64>()).unwrap();
        assert_eq!(sum, 4950);
    }

    #[test]
    fn test_pool_is_reused_for_same_size() {
        let first = pool_with_size(3).unwrap();
        let second = pool_with_size(3).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.current_num_threads(), 3);
        assert_eq!(second.install(rayon::current_num_threads), 3);
    }

    #[test]
    fn test_lock_accumulates_across_workers() {
        let counter = Lock::new(0usize);

        (0..1000).into_par_iter().for_each(|_| {
            let mut guard = counter.acquire();
            *guard += 1;
            Lock::release(guard);
        });

        assert_eq!(counter.into_inner(), 1000);
    }
}
