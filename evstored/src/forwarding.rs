//! Client writes forwarded from a replica to the master
use std::collections::HashMap;

use evstored_api::peer::ForwardWriteCompleted;
use evstored_api::{CorrelationId, OperationResult};
use tracing::{debug, trace};

use crate::message::{ClientResponse, Envelope};

/// Callers waiting for a write forwarded to the master
///
/// Every registered caller gets exactly one reply: the master's
/// outcome or a `ForwardTimeout`, whichever comes first.
#[derive(Default)]
pub struct ForwardingProxy {
    pending: HashMap<CorrelationId, Envelope>,
}

impl ForwardingProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `envelope`, returning the id the forwarded write travels under
    pub fn register(&mut self, envelope: Envelope) -> CorrelationId {
        let internal_corr_id = CorrelationId::new_random();
        self.pending.insert(internal_corr_id, envelope);
        internal_corr_id
    }

    /// Returns `false` if the caller already got its reply
    pub fn complete(&mut self, completed: ForwardWriteCompleted) -> bool {
        let Some(envelope) = self.pending.remove(&completed.internal_corr_id) else {
            trace!(internal_corr_id = %completed.internal_corr_id, "Late forwarded write result");
            return false;
        };
        envelope.reply(ClientResponse::WriteCompleted {
            result: completed.result,
            first_position: completed.first_position,
            last_position: completed.last_position,
        });
        true
    }

    /// Returns `false` if the caller already got its reply
    pub fn timeout(&mut self, internal_corr_id: CorrelationId) -> bool {
        let Some(envelope) = self.pending.remove(&internal_corr_id) else {
            return false;
        };
        debug!(%internal_corr_id, "Forwarded write timed out");
        envelope.reply(ClientResponse::WriteCompleted {
            result: OperationResult::ForwardTimeout,
            first_position: -1,
            last_position: -1,
        });
        true
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
