//! One-shot completion signal.
//!
//! An [`Event`] starts pending and is triggered exactly once. Threads can
//! block on it, poll it, or attach callbacks. Callbacks attached after the
//! trigger run immediately on the attaching thread.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

type Callback = Box<dyn FnOnce() + Send>;

enum State {
    Pending(Vec<Callback>),
    /// Trigger in progress; callbacks registered now are run by the triggering thread.
    Firing(Vec<Callback>),
    Triggered,
}

struct Inner {
    state: Mutex<State>,
    triggered: Condvar,
}

/// Shared handle to a one-shot completion signal.
///
/// Cloning is cheap; all clones observe the same state.
#[derive(Clone)]
pub struct Event {
    inner: Arc<Inner>,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

impl Event {
    /// Create a pending event.
    #[must_use]
    pub fn new() -> Self {
        Self::with_state(State::Pending(Vec::new()))
    }

    fn with_state(state: State) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                triggered: Condvar::new(),
            }),
        }
    }

    /// The shared, already-triggered event.
    #[must_use]
    pub fn completed() -> Self {
        static COMPLETED: OnceLock<Event> = OnceLock::new();
        COMPLETED
            .get_or_init(|| Self::with_state(State::Triggered))
            .clone()
    }

    /// Whether the trigger has finished running every callback.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Triggered)
    }

    /// Whether two handles refer to the same signal.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Trigger the event, run its callbacks, then wake every waiter.
    ///
    /// Only the first call has any effect.
    pub fn trigger(&self) {
        let mut batch = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending(callbacks) => {
                    let callbacks = std::mem::take(callbacks);
                    *state = State::Firing(Vec::new());
                    callbacks
                }
                State::Firing(_) | State::Triggered => return,
            }
        };

        loop {
            for callback in batch {
                callback();
            }

            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Firing(late) if !late.is_empty() => batch = std::mem::take(late),
                _ => {
                    *state = State::Triggered;
                    self.inner.triggered.notify_all();
                    return;
                }
            }
        }
    }

    /// Run `callback` once the event triggers.
    ///
    /// If it already has, `callback` runs now, before this call returns.
    pub fn register_callback(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock();
        match &mut *state {
            State::Pending(callbacks) | State::Firing(callbacks) => {
                callbacks.push(Box::new(callback));
            }
            State::Triggered => {
                drop(state);
                callback();
            }
        }
    }

    /// Block until triggered.
    pub fn join(&self) {
        let mut state = self.inner.state.lock();
        while !matches!(*state, State::Triggered) {
            self.inner.triggered.wait(&mut state);
        }
    }

    /// Block until triggered or `timeout` elapses. Returns whether it triggered.
    #[must_use]
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !matches!(*state, State::Triggered) {
            if self
                .inner
                .triggered
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return matches!(*state, State::Triggered);
            }
        }
        true
    }

    /// Guard that triggers this event when dropped.
    ///
    /// Producers hold the guard for the duration of the work so that early
    /// returns and unwinding still signal completion.
    #[must_use = "the event triggers as soon as the guard is dropped"]
    pub fn guard(&self) -> TriggerGuard {
        TriggerGuard {
            event: self.clone(),
        }
    }

    /// Event that triggers once every present input has triggered.
    ///
    /// `None` entries count as already satisfied. Avoids allocating when the
    /// answer is already known.
    #[must_use]
    pub fn aggregate(events: &[Option<Self>]) -> Self {
        let present: Vec<&Self> = events.iter().flatten().collect();

        match present.as_slice() {
            [] => return Self::completed(),
            [single] => return (*single).clone(),
            _ => {}
        }
        if present.iter().all(|e| e.is_triggered()) {
            return Self::completed();
        }

        let combined = Self::new();
        let remaining = Arc::new(AtomicUsize::new(events.len()));
        let arrive = {
            let combined = combined.clone();
            move || {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    combined.trigger();
                }
            }
        };

        for event in events {
            match event {
                Some(event) => event.register_callback(arrive.clone()),
                None => arrive(),
            }
        }

        combined
    }
}

/// Triggers its event on drop. See [`Event::guard`].
#[derive(Debug)]
pub struct TriggerGuard {
    event: Event,
}

impl TriggerGuard {
    /// The guarded event.
    #[must_use]
    pub const fn event(&self) -> &Event {
        &self.event
    }
}

impl Drop for TriggerGuard {
    fn drop(&mut self) {
        self.event.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    use proptest::prelude::*;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn counting_callback(count: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let count = Arc::clone(count);
        move || {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn trigger_is_idempotent() {
        let event = Event::new();
        let count = counter();
        event.register_callback(counting_callback(&count));

        event.trigger();
        event.trigger();

        assert!(event.is_triggered());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_callback_runs_synchronously() {
        let event = Event::new();
        event.trigger();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        event.register_callback(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn callback_may_register_on_the_same_event() {
        let event = Event::new();
        let count = counter();
        let inner_event = event.clone();
        let inner_count = Arc::clone(&count);
        event.register_callback(move || {
            inner_event.register_callback(counting_callback(&inner_count));
        });

        event.trigger();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn join_wakes_on_trigger_from_other_thread() {
        let event = Event::new();
        let remote = event.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.trigger();
        });
        event.join();
        assert!(event.is_triggered());
        handle.join().unwrap();
    }

    #[test]
    fn join_timeout_expires_when_pending() {
        let event = Event::new();
        assert!(!event.join_timeout(Duration::from_millis(5)));
        event.trigger();
        assert!(event.join_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn join_returns_after_callbacks_ran() {
        let event = Event::new();
        let count = counter();
        event.register_callback(counting_callback(&count));
        let remote = event.clone();
        let handle = thread::spawn(move || remote.trigger());
        event.join();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        handle.join().unwrap();
    }

    #[test]
    fn guard_triggers_on_drop() {
        let event = Event::new();
        {
            let _guard = event.guard();
            assert!(!event.is_triggered());
        }
        assert!(event.is_triggered());
    }

    #[test]
    fn guard_triggers_on_unwind() {
        let event = Event::new();
        let remote = event.clone();
        let result = thread::spawn(move || {
            let _guard = remote.guard();
            panic!("producer failed");
        })
        .join();
        assert!(result.is_err());
        assert!(event.is_triggered());
    }

    #[test]
    fn completed_is_a_singleton() {
        assert!(Event::completed().is_triggered());
        assert!(Event::completed().ptr_eq(&Event::completed()));
    }

    #[test]
    fn aggregate_of_nothing_is_completed() {
        assert!(Event::aggregate(&[]).ptr_eq(&Event::completed()));
        assert!(Event::aggregate(&[None]).ptr_eq(&Event::completed()));
        assert!(Event::aggregate(&[None, None]).ptr_eq(&Event::completed()));
    }

    #[test]
    fn aggregate_of_one_returns_it() {
        let event = Event::new();
        assert!(Event::aggregate(&[Some(event.clone())]).ptr_eq(&event));
    }

    #[test]
    fn aggregate_of_triggered_events_is_completed() {
        let a = Event::new();
        let b = Event::new();
        a.trigger();
        b.trigger();
        assert!(Event::aggregate(&[Some(a), None, Some(b)]).ptr_eq(&Event::completed()));
    }

    #[test]
    fn aggregate_waits_for_last_input() {
        let a = Event::new();
        let b = Event::new();
        let all = Event::aggregate(&[Some(a.clone()), None, Some(b.clone())]);
        assert!(!all.is_triggered());
        b.trigger();
        assert!(!all.is_triggered());
        a.trigger();
        assert!(all.is_triggered());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn concurrent_triggers_run_callbacks_once(threads in 2usize..8, callbacks in 1usize..16) {
            let event = Event::new();
            let count = counter();
            for _ in 0..callbacks {
                event.register_callback(counting_callback(&count));
            }

            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let event = event.clone();
                    thread::spawn(move || event.trigger())
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            prop_assert!(event.is_triggered());
            prop_assert_eq!(count.load(Ordering::SeqCst), callbacks);
        }

        #[test]
        fn aggregate_fires_once_after_all_inputs(
            inputs in proptest::collection::vec(any::<bool>(), 2..12),
            order in any::<u64>(),
        ) {
            // `true` entries are live events, `false` entries are `None`.
            let slots: Vec<Option<Event>> = inputs
                .iter()
                .map(|live| live.then(Event::new))
                .collect();
            let mut live: Vec<Event> = slots.iter().flatten().cloned().collect();
            prop_assume!(live.len() >= 2);

            let all = Event::aggregate(&slots);
            let count = counter();
            all.register_callback(counting_callback(&count));

            // Deterministic shuffle driven by the generated seed.
            let mut seed = order;
            for i in (1..live.len()).rev() {
                seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                let j = usize::try_from(seed >> 33).unwrap() % (i + 1);
                live.swap(i, j);
            }

            let last = live.len() - 1;
            for (i, event) in live.iter().enumerate() {
                prop_assert!(!all.is_triggered());
                event.trigger();
                if i < last {
                    prop_assert_eq!(count.load(Ordering::SeqCst), 0);
                }
            }
            prop_assert!(all.is_triggered());
            prop_assert_eq!(count.load(Ordering::SeqCst), 1);

            for event in &live {
                event.trigger();
            }
            prop_assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }
}
