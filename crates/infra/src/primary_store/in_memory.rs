use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use eventpipe_core::{Event, EventId};
use eventpipe_events::DeliveryContext;

use super::r#trait::{InsertOutcome, PrimaryStore, PrimaryStoreError};

#[derive(Debug, Default)]
struct State {
    rows: BTreeMap<EventId, (i64, Event)>,
    next_id: i64,
    failure: Option<PrimaryStoreError>,
}

/// In-memory primary store.
///
/// Intended for tests/dev. `fail_with` makes every insert fail until
/// `recover` is called, simulating an outage.
#[derive(Debug, Default)]
pub struct InMemoryPrimaryStore {
    state: Mutex<State>,
    attempts: AtomicU64,
}

impl InMemoryPrimaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_with(&self, err: PrimaryStoreError) {
        self.state().failure = Some(err);
    }

    pub fn recover(&self) {
        self.state().failure = None;
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.state().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, event_id: &str) -> Option<Event> {
        let key: EventId = event_id.parse().ok()?;
        self.state().rows.get(&key).map(|(_, e)| e.clone())
    }

    /// Total insert calls, including failed and duplicate ones.
    pub fn insert_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PrimaryStore for InMemoryPrimaryStore {
    async fn insert_if_absent(
        &self,
        event: &Event,
        _ctx: &DeliveryContext,
    ) -> Result<InsertOutcome, PrimaryStoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state();
        if let Some(err) = &state.failure {
            return Err(err.clone());
        }
        if state.rows.contains_key(event.event_id()) {
            return Ok(InsertOutcome::AlreadyExists);
        }

        state.next_id += 1;
        let id = state.next_id;
        state
            .rows
            .insert(event.event_id().clone(), (id, event.clone()));
        Ok(InsertOutcome::Inserted)
    }

    async fn close(&self) {}
}
