use thiserror::Error;

use crate::model::{Cid, PinInfo};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid cid: {0:?}")]
    InvalidCid(String),

    #[error("invalid pin: {0}")]
    InvalidPin(String),

    #[error("pin tracker is shut down")]
    ShutDown,

    /// Reconciliation could not verify every record. `partial` holds the
    /// records that were reconciled before and despite the failures.
    #[error("sync failed for {} cid(s): {}", failures.len(), summarize(failures))]
    Sync {
        partial: Vec<PinInfo>,
        failures: Vec<(Cid, String)>,
    },
}

fn summarize(failures: &[(Cid, String)]) -> String {
    failures
        .iter()
        .map(|(cid, e)| format!("{cid}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}
