//! Per-message dispatch: cacheability, reference substitution and run counting.

use crate::core::forward_msg::{hash_bytes, ForwardMsg};
use crate::core::forward_msg_cache::ForwardMsgCache;
use crate::runtime::session_manager::ActiveSessionInfo;

/// Prepares `msg` for delivery to `info`'s client and returns what should go on the wire.
///
/// Records the message in `cache` when cacheable. A successful script finish advances the
/// session's run count and prunes the session's expired cache references.
pub(crate) fn prepare_for_send(
    cache: &mut ForwardMsgCache,
    info: &ActiveSessionInfo,
    mut msg: ForwardMsg,
    min_cached_message_size: usize,
) -> ForwardMsg {
    let session_id = info.session.id();

    msg.metadata.cacheable = false;
    if msg.is_cacheable_type() {
        let bytes = msg.payload_bytes();
        if bytes.len() >= min_cached_message_size {
            msg.metadata.cacheable = true;
            if msg.hash.is_none() {
                msg.hash = Some(hash_bytes(&bytes));
            }
        }
    }

    let mut outbound = None;
    if msg.metadata.cacheable {
        let run_count = info.script_run_count();
        if cache.has_message_reference(&msg, session_id, run_count) {
            outbound = Some(ForwardMsgCache::create_reference_msg(&msg));
        }
        cache.add_message(&mut msg, session_id, run_count);
    }

    if msg.is_script_finished_successfully() {
        let run_count = info.increment_script_run_count();
        cache.remove_expired_session_entries(session_id, run_count);
    }

    outbound.unwrap_or(msg)
}
