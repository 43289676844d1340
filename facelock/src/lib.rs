//! Smart-lock face recognition core: gallery cache, nearest-neighbor
//! matcher, lockout policy, and the thin adapters around them (camera,
//! line-protocol peripheral, notifications, remote corpus sync).
//!
//! The recognition pipeline is deliberately session-shaped: a
//! [`session::LockSession`] owns one gallery and one lockout state per lock
//! identity, and a caller feeds it frames. Gallery rebuilds produce new
//! values swapped in whole - matching never races a mutation.

pub mod camera;
pub mod config;
pub mod extractor;
pub mod gallery;
pub mod image_ops;
pub mod lockout;
pub mod matcher;
pub mod notify;
pub mod peripheral;
pub mod remote;
pub mod session;
pub mod store;

mod error;

pub use crate::error::{Error, LockResult};
