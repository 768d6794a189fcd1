/*!
 * Inter-Process Channel
 * FIFO-based framed messaging between the agent and worker processes
 */

pub mod channel;
pub mod types;

pub use channel::{cancel_frame, WorkerChannel, WorkerConnection};
pub use types::{ChannelError, ChannelMessage, ChannelResult, MessageType};
