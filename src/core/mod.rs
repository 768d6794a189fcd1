/*!
 * Core Module
 * Shared identifiers and synchronization primitives
 */

pub mod sync;
pub mod types;

pub use sync::ResetEvent;
pub use types::{JobId, MessageId, SessionId};
