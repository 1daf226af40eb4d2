//! Message types and the buffers that carry them to the browser.

pub mod back_msg;
pub mod client_state;
pub mod delta;
pub mod forward_msg;
pub mod forward_msg_cache;
pub mod message_queue;
