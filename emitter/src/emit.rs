//! Fan-out of one [`Sender`] per source ID.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::{
    envelope::Kind,
    ingress::Connector,
    sender::{Sender, Summary},
};

/// Emit envelopes of `kind` for every source ID and wait for all of them.
///
/// Each source ID gets its own task and its own client. Duplicate IDs are
/// emitted for twice. An ID whose client cannot be created is logged and
/// skipped, the rest proceed. The returned summaries are in completion order.
pub async fn emit<C>(connector: Arc<C>, kind: Kind, source_ids: Vec<String>) -> Vec<Summary>
where
    C: Connector,
{
    let mut join_set = JoinSet::new();
    for source_id in source_ids {
        let client = match connector.connect() {
            Ok(client) => client,
            Err(err) => {
                error!("failed to connect for {source_id}: {err}");
                continue;
            }
        };
        join_set.spawn(Sender::new(kind, source_id, client).run());
    }
    debug!("Waiting on {} {kind} senders", join_set.len());

    let mut summaries = Vec::with_capacity(join_set.len());
    while let Some(res) = join_set.join_next().await {
        match res {
            Ok(summary) => summaries.push(summary),
            Err(err) => error!("Could not join the spawned sender task: {err}"),
        }
    }
    summaries
}
