use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::wire::Action;

use super::{CallError, Reply};

pub(crate) type ReplySender = oneshot::Sender<Result<Reply, CallError>>;

/// Deadline offset used when a timeout is too large to add to the clock
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Request id source: increments by one, wrapping back to 0 past `u64::MAX`
#[derive(Debug, Default)]
pub(crate) struct IdGen {
    next: u64,
}

impl IdGen {
    #[cfg(test)]
    pub fn starting_at(next: u64) -> Self {
        Self { next }
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next = id.checked_add(1).unwrap_or(0);
        id
    }
}

/// Matches a response to the call that caused it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CorrelationKey {
    pub action: Action,
    pub id: String,
}

impl CorrelationKey {
    pub fn new(action: Action, id: impl Into<String>) -> Self {
        Self {
            action,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.action, self.id)
    }
}

pub(crate) struct PendingCall {
    reply: ReplySender,
    deadline: Instant,
    timeout: Duration,
}

impl PendingCall {
    /// Resolve the caller. A caller that stopped waiting is ignored.
    pub fn resolve(self, result: Result<Reply, CallError>) {
        let _ = self.reply.send(result);
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// In-flight calls, keyed by `(action, id)`. At most one entry per key; an
///  entry leaves the table exactly once.
#[derive(Default)]
pub(crate) struct PendingCalls {
    ids: IdGen,
    calls: HashMap<CorrelationKey, PendingCall>,
}

impl PendingCalls {
    #[cfg(test)]
    pub fn with_ids(ids: IdGen) -> Self {
        Self {
            ids,
            calls: HashMap::new(),
        }
    }

    /// Next id not held by any in-flight call of `action`
    pub fn allocate(&mut self, action: Action) -> CorrelationKey {
        loop {
            let key = CorrelationKey::new(action, self.ids.next_id().to_string());
            if !self.calls.contains_key(&key) {
                return key;
            }
        }
    }

    /// Id for a frame that expects no correlated response
    pub fn next_id(&mut self) -> u64 {
        self.ids.next_id()
    }

    pub fn register(&mut self, key: CorrelationKey, reply: ReplySender, timeout: Duration) -> Instant {
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE);
        self.calls.insert(
            key,
            PendingCall {
                reply,
                deadline,
                timeout,
            },
        );
        deadline
    }

    pub fn take(&mut self, key: &CorrelationKey) -> Option<PendingCall> {
        self.calls.remove(key)
    }

    /// Remove the call under `key` if its deadline has passed. A newer call
    ///  that reused the id after wrap-around is left alone.
    pub fn take_expired(&mut self, key: &CorrelationKey, now: Instant) -> Option<PendingCall> {
        match self.calls.get(key) {
            Some(call) if call.deadline <= now => self.calls.remove(key),
            _ => None,
        }
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (CorrelationKey, PendingCall)> + '_ {
        self.calls.drain()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ids_wrap_to_zero() {
        let mut ids = IdGen::starting_at(u64::MAX - 1);
        assert_eq!(ids.next_id(), u64::MAX - 1);
        assert_eq!(ids.next_id(), u64::MAX);
        assert_eq!(ids.next_id(), 0);
        assert_eq!(ids.next_id(), 1);
    }

    #[tokio::test]
    async fn test_allocate_skips_ids_still_in_flight() {
        let mut pending = PendingCalls::with_ids(IdGen::starting_at(u64::MAX));
        let first = pending.allocate(Action::Query);
        assert_eq!(first.id, u64::MAX.to_string());
        let (tx, _rx) = oneshot::channel();
        pending.register(first.clone(), tx, Duration::from_secs(1));

        // same id under another action does not collide
        let other = pending.allocate(Action::Create);
        assert_eq!(other.id, "0");

        let mut pending = PendingCalls::with_ids(IdGen::starting_at(7));
        let (tx, _rx) = oneshot::channel();
        pending.register(CorrelationKey::new(Action::Query, "7"), tx, Duration::from_secs(1));
        assert_eq!(pending.allocate(Action::Query).id, "8");
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_expired_respects_deadline() {
        let mut pending = PendingCalls::default();
        let key = pending.allocate(Action::Query);
        let (tx, rx) = oneshot::channel();
        let deadline = pending.register(key.clone(), tx, Duration::from_millis(100));

        assert!(pending
            .take_expired(&key, deadline - Duration::from_millis(1))
            .is_none());
        let call = pending.take_expired(&key, deadline).unwrap();
        assert_eq!(call.timeout(), Duration::from_millis(100));
        call.resolve(Err(CallError::Timeout(Duration::from_millis(100))));

        assert_eq!(
            rx.await.unwrap(),
            Err(CallError::Timeout(Duration::from_millis(100)))
        );
        assert_eq!(pending.len(), 0);
        assert!(pending.take(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_timeout_does_not_overflow_the_clock() {
        let mut pending = PendingCalls::default();
        let key = pending.allocate(Action::Query);
        let (tx, _rx) = oneshot::channel();
        let deadline = pending.register(key.clone(), tx, Duration::MAX);

        assert!(deadline >= Instant::now() + FAR_FUTURE);
        assert!(pending.take_expired(&key, Instant::now()).is_none());
        assert_eq!(pending.len(), 1);
    }
}
