//! Recovery Task
//!
//! Redelivers completed groups that a recoverable repository still holds
//! because their delivery was never confirmed. Each exchange gets a bounded
//! number of redeliveries; once exhausted it is moved to the dead letter
//! endpoint and confirmed so it is not recovered again.

use crate::engine::{EngineInner, EngineState};
use crate::repository::RecoverableRepository;
use accrete_core::error::DeliveryError;
use accrete_core::{headers, Exchange, ExchangeId};
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::{debug, error, info, trace, warn};

/// Redelivery attempts per exchange id.
#[derive(Debug, Default)]
pub struct RedeliveryState {
    counters: DashMap<ExchangeId, u32>,
}

impl RedeliveryState {
    pub fn get(&self, exchange_id: &ExchangeId) -> Option<u32> {
        self.counters.get(exchange_id).map(|c| *c)
    }

    /// Bumps the counter and returns the new value.
    pub fn increment(&self, exchange_id: &ExchangeId) -> u32 {
        let mut counter = self.counters.entry(*exchange_id).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn remove(&self, exchange_id: &ExchangeId) {
        self.counters.remove(exchange_id);
    }

    pub fn clear(&self) {
        self.counters.clear();
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

/// Outcome of inspecting one scanned exchange under the shared lock.
enum RecoveryAction {
    Skip,
    Resubmitted,
    DeadLetter { exchange: Exchange, endpoint: String },
}

impl EngineInner {
    /// Runs one recovery pass over the repository.
    pub(crate) async fn recover(&self) {
        let Some(recoverable) = self.repository.as_recoverable() else {
            return;
        };
        if self.state() != EngineState::Started {
            trace!("Recovery skipped, engine not started");
            return;
        }

        trace!("Starting recovery check");
        let scanned = recoverable.scan();
        let scanned_set: HashSet<ExchangeId> = scanned.iter().copied().collect();

        for exchange_id in scanned {
            if self.state() != EngineState::Started {
                info!("Engine is stopping, recovery interrupted");
                return;
            }

            match self.plan_recovery(recoverable, &exchange_id) {
                RecoveryAction::Skip | RecoveryAction::Resubmitted => {}
                RecoveryAction::DeadLetter { exchange, endpoint } => {
                    self.move_to_dead_letter(recoverable, exchange, &endpoint)
                        .await;
                }
            }
        }

        // nothing left to confirm for ids the repository no longer holds
        self.unconfirmed.retain(|id| scanned_set.contains(id));
        trace!("Recovery check complete");
    }

    fn plan_recovery(
        &self,
        recoverable: &dyn RecoverableRepository,
        exchange_id: &ExchangeId,
    ) -> RecoveryAction {
        let _guard = self.lock.acquire();

        if self.unconfirmed.contains(exchange_id) {
            if recoverable.confirm_with_result(exchange_id) {
                debug!(%exchange_id, "Confirmed previously delivered exchange");
                self.unconfirmed.remove(exchange_id);
            }
            return RecoveryAction::Skip;
        }

        if self.in_progress.contains(exchange_id) {
            trace!(%exchange_id, "Aggregated exchange already in progress");
            return RecoveryAction::Skip;
        }

        let Some(mut exchange) = recoverable.recover(exchange_id) else {
            return RecoveryAction::Skip;
        };
        debug!(%exchange_id, "Loaded aggregated exchange to be recovered");
        exchange.set_header(headers::REDELIVERED, true);

        let settings = recoverable.settings();
        let maximum = settings.maximum_redeliveries;

        if let Some(counter) = self.redelivery.get(exchange_id) {
            if maximum > 0 && counter >= maximum {
                exchange.set_header(headers::REDELIVERY_COUNTER, counter);
                return match &settings.dead_letter_uri {
                    Some(endpoint) => {
                        warn!(
                            %exchange_id,
                            attempts = maximum,
                            dead_letter = %endpoint,
                            "Recovered exchange is exhausted, moving to dead letter endpoint"
                        );
                        RecoveryAction::DeadLetter {
                            exchange,
                            endpoint: endpoint.clone(),
                        }
                    }
                    None => {
                        warn!(
                            %exchange_id,
                            attempts = maximum,
                            "Recovered exchange is exhausted and no dead letter endpoint is configured"
                        );
                        RecoveryAction::Skip
                    }
                };
            }
        }

        let counter = self.redelivery.increment(exchange_id);
        exchange.set_header(headers::REDELIVERY_COUNTER, counter);
        if maximum > 0 {
            exchange.set_header(headers::REDELIVERY_MAX_COUNTER, maximum);
        }
        debug!(%exchange_id, attempt = counter, "Redelivering recovered exchange");

        self.on_submit_completion(exchange);
        RecoveryAction::Resubmitted
    }

    async fn move_to_dead_letter(
        &self,
        recoverable: &dyn RecoverableRepository,
        exchange: Exchange,
        endpoint: &str,
    ) {
        let exchange_id = exchange.id();
        let Some(sink) = self.endpoints.get(endpoint) else {
            error!(%exchange_id, endpoint, "Dead letter endpoint is not registered");
            return;
        };

        match sink.process(exchange).await {
            Ok(()) => {
                recoverable.confirm_with_result(&exchange_id);
                self.redelivery.remove(&exchange_id);
            }
            Err(err) => {
                let err = DeliveryError::DeadLetterFailed {
                    exchange_id: exchange_id.to_string(),
                    endpoint: endpoint.to_string(),
                    reason: err.to_string(),
                };
                error!(%exchange_id, error = %err, "Failed to move recovered exchange");
            }
        }
    }
}
