//! Shared plumbing of the keygen and keysign session controllers

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tss_core::blame::{Manager as BlameManager, TSS_TIMEOUT};
use tss_core::party::phases;
use tss_core::round::RoundEngine;

/// Which protocol a session runs; decides which unicast phase timeout
/// blame falls back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Keygen,
    Keysign,
}

/// Attribute a round timeout: blame whoever failed to deliver the stalled
/// round's broadcast, plus whoever failed the nearest unicast phase.
pub fn apply_timeout_blame(blame: &BlameManager, kind: SessionKind) {
    let Some(last) = blame.last_msg() else {
        blame.set_blame(TSS_TIMEOUT, vec![], false);
        return;
    };

    let unicast_round = if phases::is_unicast_round(&last.round_info) {
        last.round_info.clone()
    } else {
        match kind {
            SessionKind::Keygen => phases::keygen_unicast_round().to_string(),
            SessionKind::Keysign => {
                phases::previous_keysign_unicast(&last.round_info).to_string()
            }
        }
    };

    let unicast_nodes = blame.get_unicast_blame(&unicast_round).unwrap_or_else(|e| {
        error!(error = %e, "fail to get the unicast blame nodes");
        vec![]
    });
    let broadcast_nodes = blame.get_broadcast_blame(&last.round_info).unwrap_or_else(|e| {
        error!(error = %e, "fail to get the broadcast blame nodes");
        vec![]
    });

    blame.set_blame(TSS_TIMEOUT, vec![], !last.is_broadcast);
    blame.add_blame_nodes(broadcast_nodes);
    blame.add_blame_nodes(unicast_nodes);
}

/// After the local party completed: announce task-done, then wait for the
/// rest of the committee. When confirmations stall below N−1 for the grace
/// period, the silent peers are blamed but the session still succeeds.
pub async fn confirm_task_done(engine: &Arc<RoundEngine>, grace: Duration) {
    let mut done = engine.task_done_watch();
    if let Err(e) = engine.notify_task_done().await {
        error!(error = %e, "fail to broadcast the task done notification");
    }

    let all_done = tokio::time::timeout(grace, async {
        loop {
            if *done.borrow_and_update() {
                return;
            }
            if done.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .is_ok();

    if all_done {
        return;
    }
    let finished = engine.finished_peers();
    let blame = engine.blame_manager();
    match blame.missing_finisher_blame(&finished) {
        Ok(nodes) if !nodes.is_empty() => {
            info!(count = nodes.len(), "peers never confirmed task done");
            blame.set_blame(TSS_TIMEOUT, nodes, false);
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "fail to attribute missing finishers"),
    }
}
