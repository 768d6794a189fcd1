/*!
 * Run Loop
 * Top-level agent loop tying the queue, dispatcher, and updater together
 */

pub mod runloop;

pub use runloop::{ExitCode, RunLoop};
