//! Gateway data model module.
//!
//! # Purpose
//! Re-exports the session, subscription, and message models shared by the
//! registry, the store backends, and the HTTP API.
mod message;
mod session;
mod subscription;

pub use message::{StoredMessage, message_log_name};
pub use session::{ConnectionState, SessionInfo};
pub use subscription::SubscriptionRecord;
