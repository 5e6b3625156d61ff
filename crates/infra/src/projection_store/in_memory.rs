use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use eventpipe_core::{Event, EventId};

use super::r#trait::{ProjectionError, ProjectionStore};

#[derive(Debug, Default)]
struct State {
    rows: BTreeMap<EventId, Event>,
    /// Failures returned by the next calls, in order.
    scripted: VecDeque<ProjectionError>,
    /// Returned by every call once `scripted` is drained.
    outage: Option<ProjectionError>,
    calls: u64,
}

/// In-memory projection store with scripted failures, for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryProjectionStore {
    state: Mutex<State>,
}

impl InMemoryProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `times` calls with `err`, then behave normally.
    pub fn fail_next(&self, times: usize, err: ProjectionError) {
        let mut state = self.state();
        state.scripted.extend(std::iter::repeat_n(err, times));
    }

    /// Fail every call with `err` until [`recover`](Self::recover).
    pub fn fail_always(&self, err: ProjectionError) {
        self.state().outage = Some(err);
    }

    pub fn recover(&self) {
        let mut state = self.state();
        state.scripted.clear();
        state.outage = None;
    }

    pub fn calls(&self) -> u64 {
        self.state().calls
    }

    pub fn len(&self) -> usize {
        self.state().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, event_id: &str) -> bool {
        event_id
            .parse::<EventId>()
            .is_ok_and(|id| self.state().rows.contains_key(&id))
    }
}

#[async_trait]
impl ProjectionStore for InMemoryProjectionStore {
    async fn upsert(&self, event: &Event) -> Result<(), ProjectionError> {
        let mut state = self.state();
        state.calls += 1;

        if let Some(err) = state.scripted.pop_front() {
            return Err(err);
        }
        if let Some(err) = &state.outage {
            return Err(err.clone());
        }

        state.rows.insert(event.event_id().clone(), event.clone());
        Ok(())
    }

    async fn close(&self) {}
}
