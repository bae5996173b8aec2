//! Execution request records.

use crate::id::{CellId, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One invocation of one cell.
///
/// Created by the execution router per invocation; exactly one outstanding
/// request may exist per cell at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Correlation id for every message this invocation produces.
    pub request_id: RequestId,
    /// The cell being invoked.
    pub cell_id: CellId,
    /// Serializable invocation input.
    pub payload: serde_json::Value,
    /// When the router accepted the request.
    pub issued_at: DateTime<Utc>,
}

impl ExecutionRequest {
    /// Create a request stamped now with a fresh id.
    #[must_use]
    pub fn new(cell_id: CellId, payload: serde_json::Value) -> Self {
        Self {
            request_id: RequestId::new(),
            cell_id,
            payload,
            issued_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_request_gets_a_fresh_id() {
        let a = ExecutionRequest::new(CellId::from("c"), serde_json::Value::Null);
        let b = ExecutionRequest::new(CellId::from("c"), serde_json::Value::Null);
        assert_ne!(a.request_id, b.request_id);
    }
}
