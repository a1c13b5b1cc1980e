//! Moves finish/loop notifications off the audio thread.
//!
//! The callback enqueues small events under a short mutex; the embedder
//! drains them from a thread of its choosing. User closures never run on
//! the audio thread and never run under the queue lock.

use std::collections::VecDeque;
use std::sync::Weak;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use crate::stream::{StreamShared, StreamToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventKind {
    Finished,
    Looped,
}

pub(crate) struct StreamEvent {
    pub token: StreamToken,
    pub kind: EventKind,
    pub stream: Weak<StreamShared>,
}

pub struct CallbackDispatcher {
    queue: Mutex<VecDeque<StreamEvent>>,
}

impl CallbackDispatcher {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn enqueue(&self, event: StreamEvent) {
        self.queue.lock().push_back(event);
    }

    /// Drains the queue and invokes the matching callback for each event.
    /// Events for streams that died since enqueue are discarded.
    pub fn dispatch(&self) {
        let drained: Vec<StreamEvent> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        for event in drained {
            let Some(shared) = event.stream.upgrade() else {
                continue;
            };
            if !shared.alive.load(Ordering::SeqCst) {
                continue;
            }
            let slot = match event.kind {
                EventKind::Finished => shared.finish_cb.load_full(),
                EventKind::Looped => shared.loop_cb.load_full(),
            };
            if let Some(slot) = slot {
                (slot.f)(event.token);
            }
        }
    }

    /// Drops every queued event for `token`; part of stream teardown.
    pub(crate) fn cleanup(&self, token: StreamToken) {
        self.queue.lock().retain(|e| e.token != token);
    }

    #[cfg(test)]
    pub(crate) fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::test_support::shared_for_tests;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn dispatch_invokes_callbacks_in_order() {
        let dispatcher = CallbackDispatcher::new();
        let shared = shared_for_tests();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_finish = order.clone();
        shared.set_finish_callback_for_tests(move |_| order_finish.lock().push("finish"));
        let order_loop = order.clone();
        shared.set_loop_callback_for_tests(move |_| order_loop.lock().push("loop"));

        dispatcher.enqueue(StreamEvent {
            token: shared.token,
            kind: EventKind::Looped,
            stream: Arc::downgrade(&shared),
        });
        dispatcher.enqueue(StreamEvent {
            token: shared.token,
            kind: EventKind::Finished,
            stream: Arc::downgrade(&shared),
        });
        dispatcher.dispatch();

        assert_eq!(*order.lock(), vec!["loop", "finish"]);
        assert_eq!(dispatcher.queued_len(), 0);
    }

    #[test]
    fn events_for_dead_streams_are_dropped() {
        let dispatcher = CallbackDispatcher::new();
        let shared = shared_for_tests();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = fired.clone();
        shared.set_finish_callback_for_tests(move |_| {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        });
        dispatcher.enqueue(StreamEvent {
            token: shared.token,
            kind: EventKind::Finished,
            stream: Arc::downgrade(&shared),
        });
        drop(shared);
        dispatcher.dispatch();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cleanup_removes_only_matching_tokens() {
        let dispatcher = CallbackDispatcher::new();
        let a = shared_for_tests();
        let b = shared_for_tests();
        dispatcher.enqueue(StreamEvent {
            token: a.token,
            kind: EventKind::Finished,
            stream: Arc::downgrade(&a),
        });
        dispatcher.enqueue(StreamEvent {
            token: b.token,
            kind: EventKind::Finished,
            stream: Arc::downgrade(&b),
        });
        dispatcher.cleanup(a.token);
        assert_eq!(dispatcher.queued_len(), 1);
    }
}
