mod lock_key;

#[cfg(feature = "postgres")]
pub mod postgres_lock;

pub use lock_key::BucketLockKey;

#[cfg(feature = "postgres")]
pub use postgres_lock::{lock_in_transaction, LockError};
