//! Checkout pool for codec contexts.
//!
//! A pool belongs to one worker (one [`ArtifactClient`](crate::ArtifactClient)).
//! Contexts move out of the pool on checkout and back in when the
//! [`PooledContext`] guard drops, so a context is owned by exactly one caller
//! at any time. Contexts are reset before they re-enter the idle list.
//! [`CompressionContextPool::shutdown`] disposes idle contexts; guards that
//! drop afterwards dispose theirs instead of returning them.

use super::CodecContext;
use crossbeam_channel::{Receiver, Sender};
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

struct PoolInner<C> {
    idle_tx: Sender<C>,
    idle_rx: Receiver<C>,
    level: i32,
    created: AtomicU64,
    shut_down: AtomicBool,
}

pub struct CompressionContextPool<C: CodecContext> {
    inner: Arc<PoolInner<C>>,
}

impl<C: CodecContext> Clone for CompressionContextPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: CodecContext> CompressionContextPool<C> {
    /// `capacity` bounds the number of idle contexts kept around.
    pub fn new(level: i32, capacity: usize) -> Self {
        let (idle_tx, idle_rx) = crossbeam_channel::bounded(capacity);
        Self {
            inner: Arc::new(PoolInner {
                idle_tx,
                idle_rx,
                level,
                created: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn checkout(&self) -> io::Result<PooledContext<C>> {
        let ctx = match self.inner.idle_rx.try_recv() {
            Ok(ctx) => ctx,
            Err(_) => {
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                C::create(self.inner.level)?
            }
        };
        Ok(PooledContext {
            ctx: Some(ctx),
            pool: Arc::clone(&self.inner),
        })
    }

    pub fn idle(&self) -> usize {
        self.inner.idle_rx.len()
    }

    /// Contexts constructed over the pool's lifetime.
    pub fn created(&self) -> u64 {
        self.inner.created.load(Ordering::Relaxed)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Dispose every idle context. Returns how many were disposed.
    pub fn shutdown(&self) -> usize {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        let disposed = self.inner.idle_rx.try_iter().count();
        tracing::debug!(disposed, "codec pool shut down");
        disposed
    }
}

/// Exclusive borrow of a pooled context.
pub struct PooledContext<C: CodecContext> {
    ctx: Option<C>,
    pool: Arc<PoolInner<C>>,
}

impl<C: CodecContext> Deref for PooledContext<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.ctx.as_ref().expect("context present until drop")
    }
}

impl<C: CodecContext> DerefMut for PooledContext<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.ctx.as_mut().expect("context present until drop")
    }
}

impl<C: CodecContext> Drop for PooledContext<C> {
    fn drop(&mut self) {
        let Some(mut ctx) = self.ctx.take() else {
            return;
        };
        if self.pool.shut_down.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = ctx.reset() {
            tracing::warn!(context = ctx.id(), "dropping codec context that failed to reset: {}", e);
            return;
        }
        // A full idle list disposes the context.
        let _ = self.pool.idle_tx.try_send(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{Compressor, Decompressor};
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[test]
    fn test_checkout_reuses_returned_context() {
        let pool = CompressionContextPool::<Compressor>::new(3, 2);
        let first_id = {
            let ctx = pool.checkout().unwrap();
            ctx.id()
        };
        assert_eq!(pool.idle(), 1);
        let ctx = pool.checkout().unwrap();
        assert_eq!(ctx.id(), first_id);
        assert_eq!(pool.created(), 1);
    }

    #[test]
    fn test_simultaneous_checkouts_get_distinct_contexts() {
        let pool = CompressionContextPool::<Decompressor>::new(0, 4);
        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.created(), 2);
    }

    #[test]
    fn test_idle_list_is_bounded() {
        let pool = CompressionContextPool::<Compressor>::new(3, 1);
        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_reused_context_produces_identical_output() {
        let pool = CompressionContextPool::<Compressor>::new(3, 1);
        let data = b"reset between uses ".repeat(64);
        let mut first = Vec::new();
        let mut second = Vec::new();
        pool.checkout().unwrap().compress_chunk(&data, &mut first).unwrap();
        pool.checkout().unwrap().compress_chunk(&data, &mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_shutdown_disposes_idle_and_late_returns() {
        let pool = CompressionContextPool::<Compressor>::new(3, 4);
        let held = pool.checkout().unwrap();
        drop(pool.checkout().unwrap());
        assert_eq!(pool.shutdown(), 1);
        drop(held);
        assert_eq!(pool.idle(), 0);
        assert!(pool.is_shut_down());
    }

    #[test]
    fn test_no_context_is_shared_under_concurrency() {
        let pool = CompressionContextPool::<Compressor>::new(1, 4);
        let in_use = Arc::new(Mutex::new(HashSet::new()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let in_use = in_use.clone();
                std::thread::spawn(move || {
                    let mut out = Vec::new();
                    for i in 0..200u32 {
                        let mut ctx = pool.checkout().unwrap();
                        let id = ctx.id();
                        assert!(in_use.lock().unwrap().insert(id), "context {} shared", id);
                        ctx.compress_chunk(&i.to_le_bytes(), &mut out).unwrap();
                        assert!(in_use.lock().unwrap().remove(&id));
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.created() <= 8);
    }
}
