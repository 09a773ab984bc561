//! Value types shared by every side.
//!
//! - [`ids`] - validated identifiers ([`ActionId`], [`AgentId`], [`TaskUid`])
//! - [`message`] - wire messages ([`Task`], [`Progress`], [`TaskResult`])
//! - [`role`] - the three cooperating roles

pub mod ids;
pub mod message;
pub mod role;

pub use ids::{ActionId, AgentId, TaskUid};
pub use message::{Context, Progress, Task, TaskResult, PROGRESS_NOT_FOUND};
pub use role::Role;
