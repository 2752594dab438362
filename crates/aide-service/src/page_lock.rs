//! Per-page writer locks: exclusive writer per page, many concurrent
//! pages. Waiters on the same page queue FIFO on the tokio mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use aide_core::id::PageId;

/// Map entries past which acquire sweeps out unused handles.
const SWEEP_THRESHOLD: usize = 1024;

#[derive(Debug, Default)]
pub struct PageLocks {
    inner: Mutex<HashMap<PageId, Arc<tokio::sync::Mutex<()>>>>,
}

impl PageLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive handle for the page; held until the guard drops.
    pub async fn acquire(&self, page_id: PageId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().expect("Locking failed");
            if SWEEP_THRESHOLD < map.len() {
                map.retain(|_, lock| 1 < Arc::strong_count(lock));
            }
            map.entry(page_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn same_page_serializes_other_pages_do_not() {
        let locks = Arc::new(PageLocks::new());
        let page_a = PageId::generate();
        let page_b = PageId::generate();

        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(page_a).await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.expect("task finishes");
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        // Different pages interleave freely.
        let guard_a = locks.acquire(page_a).await;
        let guard_b = locks.acquire(page_b).await;
        drop(guard_a);
        drop(guard_b);
    }
}
