/*!
 * Update
 * Self-update task: version check, package download, staged restart
 */

pub mod updater;

pub use updater::{RefreshPayload, SelfUpdater, UpdateError, UpdateResult, Updater};
