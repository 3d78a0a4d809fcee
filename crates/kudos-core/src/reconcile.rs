//! Optimistic like handling on the client side.
//!
//! Every subject moves through `Idle -> Pending -> Idle`. A like bumps the
//! displayed count right away and records a [`PendingLikeIntent`]; the store
//! call then runs in the background. Success replaces the displayed count
//! with the store's value, failure rolls the optimistic bump back. While an
//! intent is pending, further likes for that subject are ignored.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    find_kudos_error, prelude::CounterStore, state::SubjectId, KudosError, KudosResult,
};

/// Identifies one like intent; also used to order authoritative updates.
pub type CorrelationToken = u64;

/// A like that was shown to the user but not yet confirmed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLikeIntent {
    pub subject: SubjectId,
    pub delta: u64,
    pub token: CorrelationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeRequest {
    /// A store call is on its way.
    Started(CorrelationToken),
    /// Another like for the subject is still in flight; nothing was done.
    Suppressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectPhase {
    Idle,
    Pending(CorrelationToken),
}

/// Outcome of a like, delivered on the channel returned by
/// [`ReconciliationClient::new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LikeEvent {
    Confirmed {
        subject: SubjectId,
        token: CorrelationToken,
        count: u64,
    },
    /// The like did not stick. `error` is retryable; `displayed` is the
    /// count after the rollback.
    Failed {
        subject: SubjectId,
        token: CorrelationToken,
        error: KudosError,
        displayed: u64,
    },
}

#[derive(Debug, Clone, Copy)]
struct Confirmed {
    count: u64,
    stamp: u64,
}

#[derive(Debug, Default)]
struct SubjectState {
    displayed: u64,
    pending: Option<PendingLikeIntent>,
    /// Last value taken from the store and when it was applied.
    confirmed: Option<Confirmed>,
}

struct Shared {
    subjects: Mutex<HashMap<SubjectId, SubjectState>>,
    sequence: AtomicU64,
    events: mpsc::UnboundedSender<LikeEvent>,
}

impl Shared {
    fn next_stamp(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn resolve(&self, subject: &SubjectId, token: CorrelationToken, result: KudosResult<u64>) {
        let event = {
            let mut subjects = self.subjects.lock();
            let Some(state) = subjects.get_mut(subject) else {
                debug!(%subject, token, "Subject detached, dropping store response");
                return;
            };
            let intent = match state.pending.take() {
                Some(intent) if intent.token == token => intent,
                other => {
                    debug!(%subject, token, "Stale store response ignored");
                    state.pending = other;
                    return;
                }
            };

            match result {
                Ok(count) => {
                    state.displayed = count;
                    state.confirmed = Some(Confirmed {
                        count,
                        stamp: self.next_stamp(),
                    });
                    LikeEvent::Confirmed {
                        subject: subject.clone(),
                        token,
                        count,
                    }
                }
                Err(err) => {
                    let error = match find_kudos_error(&err) {
                        Some(kudos @ KudosError::StoreUnavailable { .. }) => kudos.clone(),
                        _ => KudosError::store_unavailable(format!("{err:#}")),
                    };
                    let rolled_back = state.displayed.saturating_sub(intent.delta);
                    // A store value applied after this intent was issued
                    // already excludes it; never drop below that value.
                    state.displayed = match state.confirmed {
                        Some(confirmed) if confirmed.stamp > intent.token => {
                            rolled_back.max(confirmed.count)
                        }
                        _ => rolled_back,
                    };
                    warn!(%subject, token, displayed = state.displayed, "Like failed, rolled back: {error}");
                    LikeEvent::Failed {
                        subject: subject.clone(),
                        token,
                        error,
                        displayed: state.displayed,
                    }
                }
            }
        };

        // The receiver may be gone; that is the caller's business.
        let _ = self.events.send(event);
    }
}

/// Client-local like state for any number of subjects, backed by a shared
/// [`CounterStore`].
///
/// Store calls are spawned on the tokio runtime and keep running if the
/// client (or one of its subjects) goes away; they just no longer touch any
/// local state.
pub struct ReconciliationClient<S> {
    store: Arc<S>,
    shared: Arc<Shared>,
}

impl<S> ReconciliationClient<S>
where
    S: CounterStore + 'static,
{
    pub fn new(store: Arc<S>) -> (Self, mpsc::UnboundedReceiver<LikeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            subjects: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            events,
        });
        (Self { store, shared }, rx)
    }

    /// Fire-and-forget like. The outcome arrives as a [`LikeEvent`].
    pub fn request_like(&self, subject: &SubjectId) -> LikeRequest {
        let token = {
            let mut subjects = self.shared.subjects.lock();
            let state = subjects.entry(subject.clone()).or_default();
            if let Some(intent) = &state.pending {
                debug!(%subject, pending = intent.token, "Like already in flight, suppressed");
                return LikeRequest::Suppressed;
            }
            let token = self.shared.next_stamp();
            let intent = PendingLikeIntent {
                subject: subject.clone(),
                delta: 1,
                token,
            };
            state.displayed = state.displayed.saturating_add(intent.delta);
            state.pending = Some(intent);
            token
        };

        let store = Arc::clone(&self.store);
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let subject = subject.clone();
        tokio::spawn(async move {
            let result = store.increment(&subject).await;
            match shared.upgrade() {
                Some(shared) => shared.resolve(&subject, token, result),
                None => debug!(%subject, token, "Client dropped before the store answered"),
            }
        });

        LikeRequest::Started(token)
    }

    /// Fetch the stored count and show it, unless a newer store value was
    /// applied while the read was out. A pending like stays on top.
    pub async fn load(&self, subject: &SubjectId) -> KudosResult<u64> {
        let issued = self.shared.next_stamp();
        let count = self.store.read(subject).await?;

        let mut subjects = self.shared.subjects.lock();
        let state = subjects.entry(subject.clone()).or_default();
        if matches!(state.confirmed, Some(confirmed) if confirmed.stamp > issued) {
            debug!(%subject, "Newer count already applied, load discarded");
            return Ok(state.displayed);
        }
        let optimistic = state.pending.as_ref().map_or(0, |intent| intent.delta);
        state.displayed = count.saturating_add(optimistic);
        state.confirmed = Some(Confirmed {
            count,
            stamp: self.shared.next_stamp(),
        });
        Ok(state.displayed)
    }

    pub fn displayed_count(&self, subject: &SubjectId) -> u64 {
        self.shared
            .subjects
            .lock()
            .get(subject)
            .map_or(0, |state| state.displayed)
    }

    pub fn phase(&self, subject: &SubjectId) -> SubjectPhase {
        match self
            .shared
            .subjects
            .lock()
            .get(subject)
            .and_then(|state| state.pending.as_ref())
        {
            Some(intent) => SubjectPhase::Pending(intent.token),
            None => SubjectPhase::Idle,
        }
    }

    pub fn pending_intent(&self, subject: &SubjectId) -> Option<PendingLikeIntent> {
        self.shared
            .subjects
            .lock()
            .get(subject)
            .and_then(|state| state.pending.clone())
    }

    /// The view showing `subject` is gone. In-flight store calls still
    /// complete, but their results are no longer applied here.
    pub fn detach(&self, subject: &SubjectId) {
        if self.shared.subjects.lock().remove(subject).is_some() {
            debug!(%subject, "Detached");
        }
    }
}
