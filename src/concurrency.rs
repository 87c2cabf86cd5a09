//! Concurrency control: page-granularity two-phase locking.

pub mod lock;

pub use lock::{LockManager, LockMode, Permission};
