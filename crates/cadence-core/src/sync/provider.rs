use crate::models::EventPayload;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

/// Failures reported by a calendar provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Calendar call timed out")]
    Timeout,

    #[error("Calendar rate limit exceeded")]
    RateLimited,

    #[error("Calendar server error: HTTP {0}")]
    Server(u16),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote object gone: {0}")]
    Gone(String),

    #[error("Calendar access revoked: {0}")]
    Unauthorized(String),

    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl ProviderError {
    /// Transient failures are retried; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout | ProviderError::RateLimited | ProviderError::Server(_) | ProviderError::Network(_)
        )
    }
}

/// External calendar service. Every call carries the intent's idempotency key;
/// replaying a call with the same key must not duplicate remote state.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// Creates an event and returns its remote id.
    async fn create_event(&self, idempotency_key: Uuid, payload: &EventPayload) -> Result<String, ProviderError>;

    async fn update_event(
        &self,
        idempotency_key: Uuid,
        external_event_id: &str,
        payload: &EventPayload,
    ) -> Result<(), ProviderError>;

    async fn cancel_event(
        &self,
        idempotency_key: Uuid,
        external_event_id: &str,
        calendar_id: &str,
    ) -> Result<(), ProviderError>;
}

/// A remote event as held by [`InMemoryCalendarProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub id: String,
    pub payload: EventPayload,
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    events: HashMap<String, StoredEvent>,
    created_by_key: HashMap<Uuid, String>,
    update_keys: Vec<Uuid>,
    next_id: u64,
    calls: usize,
}

/// Deterministic in-process calendar. Creates and updates are deduplicated by
/// idempotency key: a repeated key is acknowledged without applying its body.
#[derive(Debug, Default)]
pub struct InMemoryCalendarProvider {
    state: Mutex<MemoryState>,
}

impl InMemoryCalendarProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StoredEvent> {
        let state = self.lock();
        let mut events: Vec<StoredEvent> = state.events.values().cloned().collect();
        events.sort_by(|a, b| a.id.cmp(&b.id));
        events
    }

    pub fn event(&self, id: &str) -> Option<StoredEvent> {
        self.lock().events.get(id).cloned()
    }

    /// Idempotency keys of applied updates, in arrival order.
    pub fn update_keys(&self) -> Vec<Uuid> {
        self.lock().update_keys.clone()
    }

    /// Number of provider calls received, including deduplicated replays.
    pub fn calls(&self) -> usize {
        self.lock().calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A panic while holding the lock cannot leave the maps half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CalendarProvider for InMemoryCalendarProvider {
    async fn create_event(&self, idempotency_key: Uuid, payload: &EventPayload) -> Result<String, ProviderError> {
        let mut state = self.lock();
        state.calls += 1;

        if let Some(existing) = state.created_by_key.get(&idempotency_key) {
            return Ok(existing.clone());
        }

        state.next_id += 1;
        let id = format!("evt-{}", state.next_id);
        state.created_by_key.insert(idempotency_key, id.clone());
        state.events.insert(
            id.clone(),
            StoredEvent {
                id: id.clone(),
                payload: payload.clone(),
                cancelled: false,
            },
        );
        Ok(id)
    }

    async fn update_event(
        &self,
        idempotency_key: Uuid,
        external_event_id: &str,
        payload: &EventPayload,
    ) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.calls += 1;

        if !state.events.get(external_event_id).is_some_and(|event| !event.cancelled) {
            return Err(ProviderError::Gone(external_event_id.to_string()));
        }
        if state.update_keys.contains(&idempotency_key) {
            return Ok(());
        }
        state.update_keys.push(idempotency_key);
        if let Some(event) = state.events.get_mut(external_event_id) {
            event.payload = payload.clone();
        }
        Ok(())
    }

    async fn cancel_event(
        &self,
        _idempotency_key: Uuid,
        external_event_id: &str,
        _calendar_id: &str,
    ) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.calls += 1;

        match state.events.get_mut(external_event_id) {
            // Cancelling twice is a successful no-op.
            Some(event) => {
                event.cancelled = true;
                Ok(())
            }
            None => Err(ProviderError::Gone(external_event_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rstest::rstest;

    fn payload() -> EventPayload {
        let start = Utc.with_ymd_and_hms(2030, 1, 7, 9, 0, 0).unwrap();
        EventPayload {
            calendar_id: "team".to_string(),
            title: "Standup".to_string(),
            description: None,
            starts_at: start,
            ends_at: start + Duration::minutes(30),
        }
    }

    #[rstest]
    #[case(ProviderError::Timeout, true)]
    #[case(ProviderError::RateLimited, true)]
    #[case(ProviderError::Server(503), true)]
    #[case(ProviderError::Network("reset".into()), true)]
    #[case(ProviderError::Gone("evt".into()), false)]
    #[case(ProviderError::Unauthorized("revoked".into()), false)]
    #[case(ProviderError::Rejected("bad".into()), false)]
    fn test_transient_classification(#[case] error: ProviderError, #[case] transient: bool) {
        assert_eq!(error.is_transient(), transient);
    }

    #[tokio::test]
    async fn test_in_memory_create_deduplicates_by_key() {
        let provider = InMemoryCalendarProvider::new();
        let key = Uuid::now_v7();

        let first = provider.create_event(key, &payload()).await.unwrap();
        let second = provider.create_event(key, &payload()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.events().len(), 1);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_in_memory_update_of_missing_event_is_gone() {
        let provider = InMemoryCalendarProvider::new();
        let result = provider.update_event(Uuid::now_v7(), "evt-404", &payload()).await;
        assert!(matches!(result, Err(ProviderError::Gone(_))));
    }
}
