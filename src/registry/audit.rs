//! Periodic leak auditor: walks a shallow snapshot of the
//! registry and reports dialogs the caller no longer recognizes as active,
//! without holding an index-wide lock across the callback.

use super::stack_registry::StackRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Spawns a background sweep every `interval`. `active_call_ids` is called
/// fresh on each tick so the auditor never assumes a stale view of what the
/// upper layer still considers live.
pub fn spawn_leak_auditor<F, I>(registry: Arc<StackRegistry>, interval: Duration, mut active_call_ids: F)
where
    F: FnMut() -> I + Send + 'static,
    I: Iterator<Item = String>,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let active = active_call_ids();
            let active_refs: Vec<String> = active.collect();
            let stale = registry.audit_unreferenced(active_refs.iter().map(|s| s.as_str()));
            if !stale.is_empty() {
                warn!(count = stale.len(), "leak auditor found unreferenced dialogs");
            }
        }
    });
}
