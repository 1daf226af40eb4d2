//! Session engine for rerun-on-change script apps.
//!
//! Invariant: a session's browser only ever receives messages through the runtime loop's
//! send pass, which is also the only writer of the forward-message cache.
//!
//! # Public API Overview
//! - Describe the app as a [`Script`] (or a closure via [`script_fn`]) that emits deltas
//!   through a [`ScriptContext`].
//! - Create the process [`Runtime`], connect clients implementing [`SessionClient`] and
//!   route their [`BackMsg`] requests through [`Runtime::handle_backmsg`].
//! - Drive an [`AppSession`] directly with a [`LoopHandle`] when embedding without the
//!   runtime loop.

pub mod config;
pub mod core;
pub mod error;
pub mod event_loop;
pub mod logging;
pub mod runtime;
pub mod script;
pub mod services;
pub mod session;

pub(crate) mod sync;

pub use crate::config::RuntimeConfig;
pub use crate::core::back_msg::{BackMsg, UploadedFile};
pub use crate::core::client_state::{ClientState, WidgetStates, WidgetValue};
pub use crate::core::delta::{Block, BlockKind, Delta, Element, ExceptionInfo};
pub use crate::core::forward_msg::{
    ForwardMsg, ForwardMsgPayload, ScriptFinishedStatus, SessionEvent, SessionStatus, UserInfo,
};
pub use crate::core::forward_msg_cache::ForwardMsgCache;
pub use crate::core::message_queue::MessageQueue;
pub use crate::error::RuntimeError;
pub use crate::event_loop::LoopHandle;
pub use crate::logging::init_logging;
pub use crate::runtime::{Runtime, RuntimeState, SessionClient, SessionClientDisconnectedError};
pub use crate::script::{
    script_fn, Interrupt, RerunData, Script, ScriptContext, ScriptError, ScriptRequest,
    ScriptRequestQueue,
};
pub use crate::session::{AppSession, AppSessionState, SessionServices};
