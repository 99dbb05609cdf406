//! Storage and distributed coordination for the power control service.
//!
//! Two traits carry the whole surface: [`StorageProvider`] persists
//! transitions, power-cap tasks and power status, and
//! [`DistributedLockProvider`] elects a single active replica. Each has a
//! memory, an etcd and a PostgreSQL implementation, all checked by the
//! shared [`conformance`] suite.

pub mod conformance;
mod config;
mod error;
mod etcd;
mod memory;
mod postgres;
mod traits;

pub use config::{EtcdConfig, LockName, PostgresConfig};
pub use error::{BoxError, StorageError};
pub use etcd::{EtcdLockProvider, EtcdStorage};
pub use memory::{MemoryLockProvider, MemoryStorage};
pub use postgres::{lock_ids, AdvisoryLock, PostgresLockProvider, PostgresStorage};
pub use traits::{DistributedLockProvider, StorageProvider, MIN_LOCK_DURATION};
