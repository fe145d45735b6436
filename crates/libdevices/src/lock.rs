//! Per-pool serialization of device operations.
//!
//! Every owner in a hierarchy belongs to the same pool, so one mutex per pool
//! serializes all device operations of the hierarchy. A thread may hold at
//! most one pool at a time. Operations that descend into other owners take
//! the [`PoolToken`] of the pool they already hold instead of locking again.
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;

static POOL_LOCKS: Lazy<Mutex<HashMap<String, &'static Mutex<()>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

thread_local! {
    static HELD: RefCell<Option<String>> = RefCell::new(None);
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum LockError {
    #[error("pool {pool} is already locked by this thread")]
    Reentrant { pool: String },
    #[error("cannot lock pool {requested} while holding pool {held}")]
    CrossPool { held: String, requested: String },
}

/// Proof that the current thread holds the lock of a pool. The lock is
/// released when the token is dropped.
pub struct PoolToken {
    pool: String,
    _guard: MutexGuard<'static, ()>,
}

impl PoolToken {
    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Ensures that `pool` is the pool this token was issued for
    pub fn check(&self, pool: &str) -> Result<(), LockError> {
        if self.pool != pool {
            return Err(LockError::CrossPool {
                held: self.pool.clone(),
                requested: pool.to_owned(),
            });
        }

        Ok(())
    }
}

impl Drop for PoolToken {
    fn drop(&mut self) {
        HELD.with(|held| held.borrow_mut().take());
    }
}

impl std::fmt::Debug for PoolToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolToken").field("pool", &self.pool).finish()
    }
}

// Mutexes live for the rest of the process, so they are leaked to hand out
// guards that do not borrow from the registry.
fn pool_mutex(pool: &str) -> &'static Mutex<()> {
    let mut locks = POOL_LOCKS.lock().unwrap_or_else(PoisonError::into_inner);
    *locks
        .entry(pool.to_owned())
        .or_insert_with(|| Box::leak(Box::new(Mutex::new(()))))
}

/// Blocks until the lock of `pool` is acquired
pub fn lock(pool: &str) -> Result<PoolToken, LockError> {
    let held = HELD.with(|held| held.borrow().clone());
    match held {
        Some(held) if held == pool => {
            return Err(LockError::Reentrant {
                pool: pool.to_owned(),
            })
        }
        Some(held) => {
            return Err(LockError::CrossPool {
                held,
                requested: pool.to_owned(),
            })
        }
        None => {}
    }

    // The mutex guards no data, poisoning carries no meaning here.
    let guard = pool_mutex(pool)
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    HELD.with(|held| *held.borrow_mut() = Some(pool.to_owned()));

    Ok(PoolToken {
        pool: pool.to_owned(),
        _guard: guard,
    })
}

/// Runs `f` while holding the lock of `pool`
pub fn sync<T, E, F>(pool: &str, f: F) -> Result<T, E>
where
    E: From<LockError>,
    F: FnOnce(&PoolToken) -> Result<T, E>,
{
    let token = lock(pool)?;
    f(&token)
}

/// Returns true if the current thread holds the lock of `pool`
pub fn is_held(pool: &str) -> bool {
    HELD.with(|held| held.borrow().as_deref() == Some(pool))
}
