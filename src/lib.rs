pub mod config;
pub mod disk;
pub mod error;
pub mod flock;
pub mod hasher;
pub mod storage;

pub use config::{MergeConfig, StorageConfig};
pub use error::{Error, Result};
pub use storage::{Cursor, Environment, LookupHandle, ShardSpec, StorageType};
