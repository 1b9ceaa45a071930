//! Event ingest pipeline: policy, persistence, deletion, broadcast.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::event::Event;
use crate::filter::Filter;
use crate::message::RelayMessage;
use crate::server::ServerState;
use crate::store::SaveError;
use crate::ws::Connection;

/// How long a deletion request waits for its target to surface in storage.
const DELETE_LOOKUP_WAIT: Duration = Duration::from_millis(200);

/// Handle one EVENT envelope and reply with OK.
pub(crate) async fn do_event(state: &Arc<ServerState>, conn: &Arc<Connection>, event: Event) {
    if let Err(err) = event.verify() {
        let _ = conn
            .send(&RelayMessage::ok(event.id.as_str(), false, err.to_string()))
            .await;
        return;
    }
    let (accepted, reason) = if event.is_deletion() {
        handle_deletion(state, &event).await
    } else {
        add_event(state, &event).await
    };
    let _ = conn
        .send(&RelayMessage::ok(event.id.as_str(), accepted, reason))
        .await;
}

/// Run a validated event through policy, persistence, and broadcast.
///
/// Returns the OK flag and reason reported to the publisher.
pub(crate) async fn add_event(state: &ServerState, event: &Event) -> (bool, String) {
    if let Err(reason) = state.relay.accept_event(event).await {
        let reason = if reason.is_empty() {
            "blocked: event blocked by relay".to_string()
        } else {
            reason
        };
        return (false, reason);
    }

    // ephemeral kinds are broadcast only, never stored
    if !event.is_ephemeral() {
        state.store.before_save(event).await;
        match state.store.save_event(event).await {
            Ok(()) => state.store.after_save(event).await,
            Err(SaveError::Duplicate) => return (true, SaveError::Duplicate.to_string()),
            Err(SaveError::Other(err)) => {
                warn!(pubkey = %event.pubkey, error = %err, "failed to save");
                let msg = err.to_string();
                let reason = if has_machine_prefix(&msg) {
                    msg
                } else {
                    format!("error: failed to save ({msg})")
                };
                return (false, reason);
            }
        }
    }

    state.registry.notify(event).await;
    (true, String::new())
}

/// Process a kind-5 deletion request.
///
/// Targets that cannot be found within a short wait are skipped silently;
/// targets authored by somebody else reject the whole request.
async fn handle_deletion(state: &ServerState, deletion: &Event) -> (bool, String) {
    for target_id in deletion.tag_values("e") {
        let filter = Filter {
            ids: Some(vec![target_id.to_string()]),
            ..Default::default()
        };
        let target = match state.store.query_events(&filter).await {
            Ok(mut rx) => tokio::time::timeout(DELETE_LOOKUP_WAIT, rx.recv())
                .await
                .ok()
                .flatten(),
            Err(err) => {
                warn!(error = %err, "deletion target lookup failed");
                None
            }
        };
        let Some(target) = target else {
            continue;
        };
        if target.pubkey != deletion.pubkey {
            return (false, "insufficient permissions".to_string());
        }
        state.store.before_delete(&target.id, &target.pubkey).await;
        if let Err(err) = state.store.delete_event(&target.id).await {
            warn!(id = %target.id, error = %err, "failed to delete");
            return (false, format!("error: failed to delete ({err})"));
        }
        state.store.after_delete(&target.id, &target.pubkey).await;
    }
    (true, String::new())
}

/// True when `msg` already carries a machine-readable `word: ` prefix.
fn has_machine_prefix(msg: &str) -> bool {
    match msg.split_once(": ") {
        Some((word, _)) => {
            !word.is_empty() && word.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_prefix_detection() {
        assert!(has_machine_prefix("blocked: no thanks"));
        assert!(has_machine_prefix("rate_limited: slow down"));
        assert!(!has_machine_prefix("no prefix here"));
        assert!(!has_machine_prefix("two words: oops"));
        assert!(!has_machine_prefix(": empty"));
    }
}
