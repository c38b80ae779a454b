//! Calendar synchronization: delivers outbox intents to a [`CalendarProvider`].
//!
//! Delivery is at-least-once. Every provider call carries the intent's
//! deterministic idempotency key, so a replay after a crash converges on the
//! same remote state. Local state is authoritative: a failed delivery never
//! rolls back the instance it describes.

pub mod http;
pub mod provider;
pub mod retry;

pub use http::HttpCalendarProvider;
pub use provider::{CalendarProvider, InMemoryCalendarProvider, ProviderError, StoredEvent};
pub use retry::{RetryError, RetryPolicy};

use crate::error::CoreError;
use crate::models::{EventPayload, SyncConfig, SyncIntent, SyncOp};
use crate::repository::Store;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// What happened to one intent during a flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Delivered and acknowledged in the outbox
    Acked { external_event_id: Option<String> },
    /// No calendar target; acknowledged without a remote call
    Skipped,
    /// Transient failure or local write error; re-driven on a later tick
    Failed { error: String },
    /// Permanent failure; parked until manually re-driven
    Dead { error: String },
    /// The flush was cancelled; the intent stays pending
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub intent_id: Uuid,
    pub instance_id: Uuid,
    pub op: SyncOp,
    pub attempts: u32,
    /// An update or cancel that had to create the remote event first
    pub degraded: bool,
    pub outcome: SyncOutcome,
}

impl SyncResult {
    pub fn is_acked(&self) -> bool {
        matches!(self.outcome, SyncOutcome::Acked { .. } | SyncOutcome::Skipped)
    }
}

enum DeliveryError {
    Provider(RetryError),
    Store(CoreError),
}

impl From<RetryError> for DeliveryError {
    fn from(err: RetryError) -> Self {
        DeliveryError::Provider(err)
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        DeliveryError::Store(err)
    }
}

struct Delivered {
    external_event_id: Option<String>,
    attempts: u32,
    degraded: bool,
}

/// Translates sync intents into calendar provider calls.
pub struct CalendarSyncAdapter {
    provider: Arc<dyn CalendarProvider>,
    store: Arc<dyn Store>,
    retry: RetryPolicy,
    max_concurrent_calls: usize,
}

impl CalendarSyncAdapter {
    pub fn new(provider: Arc<dyn CalendarProvider>, store: Arc<dyn Store>, config: &SyncConfig) -> Self {
        Self {
            provider,
            store,
            retry: RetryPolicy::from_config(config),
            max_concurrent_calls: config.max_concurrent_calls.max(1),
        }
    }

    /// Loads up to `limit` pending or failed intents and flushes them.
    pub async fn flush_pending(&self, limit: u32, cancel: &CancellationToken) -> Result<Vec<SyncResult>, CoreError> {
        let intents = self.store.list_pending(limit).await?;
        Ok(self.flush(intents, cancel).await)
    }

    /// Delivers `intents` and returns one result per intent, in input order.
    ///
    /// Intents for the same instance run sequentially in the order given so a
    /// cancel never overtakes its create. Distinct instances run concurrently
    /// up to `max_concurrent_calls`.
    pub async fn flush(&self, intents: Vec<SyncIntent>, cancel: &CancellationToken) -> Vec<SyncResult> {
        let total = intents.len();
        let mut chains: Vec<Vec<(usize, SyncIntent)>> = Vec::new();
        let mut chain_of: HashMap<Uuid, usize> = HashMap::new();

        for (index, intent) in intents.into_iter().enumerate() {
            let chain = *chain_of.entry(intent.instance_id).or_insert_with(|| {
                chains.push(Vec::new());
                chains.len() - 1
            });
            chains[chain].push((index, intent));
        }

        let delivered: Vec<Vec<(usize, SyncResult)>> = stream::iter(chains)
            .map(|chain| async move {
                let mut results = Vec::with_capacity(chain.len());
                for (index, intent) in chain {
                    results.push((index, self.deliver(intent, cancel).await));
                }
                results
            })
            .buffer_unordered(self.max_concurrent_calls)
            .collect()
            .await;

        let mut ordered: Vec<Option<SyncResult>> = vec![None; total];
        for (index, result) in delivered.into_iter().flatten() {
            ordered[index] = Some(result);
        }
        ordered.into_iter().flatten().collect()
    }

    async fn deliver(&self, intent: SyncIntent, cancel: &CancellationToken) -> SyncResult {
        let mut result = SyncResult {
            intent_id: intent.id,
            instance_id: intent.instance_id,
            op: intent.op,
            attempts: 0,
            degraded: false,
            outcome: SyncOutcome::Cancelled,
        };

        if cancel.is_cancelled() {
            return result;
        }

        let Some(payload) = intent.payload.as_ref() else {
            result.outcome = match self.store.ack(intent.id, None).await {
                Ok(()) => SyncOutcome::Skipped,
                Err(err) => SyncOutcome::Failed { error: err.to_string() },
            };
            return result;
        };

        match self.dispatch(&intent, payload, cancel).await {
            Ok(delivered) => {
                result.attempts = delivered.attempts;
                result.degraded = delivered.degraded;
                result.outcome = match self.store.ack(intent.id, delivered.external_event_id.as_deref()).await {
                    Ok(()) => {
                        debug!(intent_id = %intent.id, op = %intent.op, "Sync intent acknowledged");
                        SyncOutcome::Acked {
                            external_event_id: delivered.external_event_id,
                        }
                    }
                    Err(err) => {
                        // The provider already holds the change; a replay converges through the idempotency key.
                        error!(intent_id = %intent.id, error = %err, "Failed to acknowledge delivered intent");
                        SyncOutcome::Failed { error: err.to_string() }
                    }
                };
            }
            Err(DeliveryError::Provider(RetryError::Cancelled { attempts })) => {
                result.attempts = attempts;
                debug!(intent_id = %intent.id, "Sync cancelled; intent left pending");
            }
            Err(DeliveryError::Provider(RetryError::Failed { error: cause, attempts })) => {
                result.attempts = attempts;
                let message = cause.to_string();
                if cause.is_transient() {
                    warn!(intent_id = %intent.id, op = %intent.op, attempts, error = %message, "Sync retries exhausted; will re-drive next tick");
                    result.outcome = match self.store.mark_intent_failed(intent.id, attempts, &message).await {
                        Ok(()) => SyncOutcome::Failed { error: message },
                        Err(err) => SyncOutcome::Failed { error: err.to_string() },
                    };
                } else {
                    error!(
                        intent_id = %intent.id,
                        instance_id = %intent.instance_id,
                        op = %intent.op,
                        error = %message,
                        "Calendar rejected sync intent permanently"
                    );
                    result.outcome = match self.store.mark_intent_dead(intent.id, attempts, &message).await {
                        Ok(()) => SyncOutcome::Dead { error: message },
                        Err(err) => SyncOutcome::Failed { error: err.to_string() },
                    };
                }
            }
            Err(DeliveryError::Store(err)) => {
                error!(intent_id = %intent.id, error = %err, "Store read failed during sync");
                result.outcome = SyncOutcome::Failed { error: err.to_string() };
            }
        }

        result
    }

    async fn dispatch(
        &self,
        intent: &SyncIntent,
        payload: &EventPayload,
        cancel: &CancellationToken,
    ) -> Result<Delivered, DeliveryError> {
        let known_event_id = self.known_event_id(intent).await?;

        match (intent.op, known_event_id) {
            (SyncOp::Create, Some(existing)) => {
                debug!(intent_id = %intent.id, "Instance already has a remote event; acknowledging locally");
                Ok(Delivered {
                    external_event_id: Some(existing),
                    attempts: 0,
                    degraded: false,
                })
            }
            (SyncOp::Create, None) => {
                let (created, attempts) = self.create(intent.idempotency_key, payload, cancel).await?;
                Ok(Delivered {
                    external_event_id: Some(created),
                    attempts,
                    degraded: false,
                })
            }
            (SyncOp::Update, Some(existing)) => {
                let (_, attempts) = self
                    .retry
                    .execute(cancel, || self.provider.update_event(intent.idempotency_key, &existing, payload))
                    .await?;
                Ok(Delivered {
                    external_event_id: Some(existing),
                    attempts,
                    degraded: false,
                })
            }
            (SyncOp::Update, None) => {
                warn!(intent_id = %intent.id, instance_id = %intent.instance_id, "Update intent has no remote event; creating it instead");
                let create_key = SyncIntent::idempotency_key_for(intent.instance_id, SyncOp::Create);
                let (created, attempts) = self.create(create_key, payload, cancel).await?;
                Ok(Delivered {
                    external_event_id: Some(created),
                    attempts,
                    degraded: true,
                })
            }
            (SyncOp::Cancel, Some(existing)) => {
                let attempts = self.cancel(intent.idempotency_key, &existing, payload, cancel).await?;
                Ok(Delivered {
                    external_event_id: Some(existing),
                    attempts,
                    degraded: false,
                })
            }
            (SyncOp::Cancel, None) => {
                warn!(intent_id = %intent.id, instance_id = %intent.instance_id, "Cancel intent has no remote event; creating it before cancelling");
                let create_key = SyncIntent::idempotency_key_for(intent.instance_id, SyncOp::Create);
                let (created, create_attempts) = self.create(create_key, payload, cancel).await?;
                let cancel_attempts = self.cancel(intent.idempotency_key, &created, payload, cancel).await?;
                Ok(Delivered {
                    external_event_id: Some(created),
                    attempts: create_attempts + cancel_attempts,
                    degraded: true,
                })
            }
        }
    }

    async fn create(&self, key: Uuid, payload: &EventPayload, cancel: &CancellationToken) -> Result<(String, u32), RetryError> {
        self.retry.execute(cancel, || self.provider.create_event(key, payload)).await
    }

    /// A remote event that is already gone counts as cancelled.
    async fn cancel(&self, key: Uuid, event_id: &str, payload: &EventPayload, cancel: &CancellationToken) -> Result<u32, RetryError> {
        match self
            .retry
            .execute(cancel, || self.provider.cancel_event(key, event_id, &payload.calendar_id))
            .await
        {
            Ok((_, attempts)) => Ok(attempts),
            Err(RetryError::Failed {
                error: ProviderError::Gone(_),
                attempts,
            }) => {
                debug!(event_id, "Remote event already gone; treating cancel as delivered");
                Ok(attempts)
            }
            Err(err) => Err(err),
        }
    }

    /// The remote id recorded on the intent, or on the instance if a create
    /// was acknowledged after this intent was enqueued.
    async fn known_event_id(&self, intent: &SyncIntent) -> Result<Option<String>, CoreError> {
        if let Some(id) = &intent.external_event_id {
            return Ok(Some(id.clone()));
        }
        Ok(self
            .store
            .get_instance_by_id(intent.instance_id)
            .await?
            .and_then(|instance| instance.external_event_id))
    }
}
