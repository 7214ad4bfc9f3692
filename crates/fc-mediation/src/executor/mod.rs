//! Thread pools built from declarative profiles
//!
//! - [`ThreadPoolProfile`]: optional settings merged over the default profile
//! - [`ThreadPool`]: tokio worker tasks draining a bounded queue, with delayed scheduling
//! - [`ExecutorManager`]: creates, names, tracks and shuts down pools

mod manager;
mod naming;
mod pool;
mod profile;

pub use manager::ExecutorManager;
pub use naming::ThreadNamer;
pub use pool::{PoolStats, PoolTask, ThreadPool};
pub use profile::{PoolSettings, RejectedPolicy, ThreadPoolProfile, DEFAULT_PROFILE_ID};
