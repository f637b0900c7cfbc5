//! Request/response coordinator
//!
//! Builds request semantics on top of the router: an outbound request parks a
//! oneshot sender in the pending map, the envelope travels as a normal
//! `{type: "request"}` message, and whichever of `respond` or the spawned
//! timeout task removes the pending record first settles the future. Removal
//! from the map *is* the timer cancellation, so cancelling an already-settled
//! request is a no-op and exactly one settlement occurs per request id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::lock_unpoisoned;
use crate::message::Target;
use crate::metrics::MetricsCollector;
use crate::router::Router;

/// Correlates an outbound request to its eventual settlement
struct PendingRequest {
    reply_tx: oneshot::Sender<Result<Value, BrokerError>>,
    from: String,
}

/// Tracks outstanding requests and enforces their timeouts
pub struct RequestCoordinator {
    router: Arc<Router>,
    pending: Arc<Mutex<HashMap<String, PendingRequest>>>,
    metrics: Arc<MetricsCollector>,
    default_timeout: Duration,
}

impl RequestCoordinator {
    pub fn new(router: Arc<Router>, metrics: Arc<MetricsCollector>, default_timeout: Duration) -> Self {
        Self {
            router,
            pending: Arc::new(Mutex::new(HashMap::new())),
            metrics,
            default_timeout,
        }
    }

    /// Send a request and wait for a correlated response or a timeout
    ///
    /// The pending record is inserted before routing so a responder invoked
    /// during delivery may call `respond` synchronously.
    pub async fn request(
        &self,
        from: &str,
        target: Target,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BrokerError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let request_id = Uuid::now_v7().to_string();
        debug!(request_id = %request_id, from = %from, to = %target, ?timeout, "Sending request");

        let (reply_tx, reply_rx) = oneshot::channel();
        lock_unpoisoned(&self.pending).insert(
            request_id.clone(),
            PendingRequest {
                reply_tx,
                from: from.to_string(),
            },
        );

        let envelope_payload = json!({
            "type": "request",
            "requestId": request_id,
            "payload": payload,
        });
        if let Err(e) = self.router.send(from, target, envelope_payload) {
            lock_unpoisoned(&self.pending).remove(&request_id);
            return Err(e);
        }

        // Timeout task; losing the race to respond() finds the map empty
        let pending = self.pending.clone();
        let metrics = self.metrics.clone();
        let timer_id = request_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let timed_out = lock_unpoisoned(&pending).remove(&timer_id);
            if let Some(record) = timed_out {
                warn!(request_id = %timer_id, from = %record.from, "Request timed out");
                metrics.record_timeout();
                let _ = record.reply_tx.send(Err(BrokerError::RequestTimeout {
                    request_id: timer_id,
                    timeout,
                }));
            }
        });

        reply_rx.await.map_err(|_| BrokerError::Disposed)?
    }

    /// Settle a pending request with a response
    ///
    /// Late and duplicate responses find no pending record and fail.
    pub fn respond(&self, from: &str, request_id: &str, response: Value) -> Result<(), BrokerError> {
        let record = lock_unpoisoned(&self.pending)
            .remove(request_id)
            .ok_or_else(|| BrokerError::NoPendingRequest(request_id.to_string()))?;

        debug!(request_id = %request_id, responder = %from, requester = %record.from, "Settling request");
        let _ = record.reply_tx.send(Ok(response));
        Ok(())
    }

    /// Requests currently awaiting a response
    pub fn pending_count(&self) -> usize {
        lock_unpoisoned(&self.pending).len()
    }

    /// Reject every outstanding request (broker teardown)
    pub fn dispose(&self) {
        let drained: Vec<(String, PendingRequest)> =
            lock_unpoisoned(&self.pending).drain().collect();
        for (request_id, record) in drained {
            debug!(request_id = %request_id, "Rejecting pending request on dispose");
            let _ = record.reply_tx.send(Err(BrokerError::Disposed));
        }
    }
}
