//! The change stream hub: fan-out of committed events to subscribers.
//!
//! Each subscriber owns a bounded FIFO fed under the hub's lock. A full
//! buffer marks the subscriber lagged — it is closed with
//! `ChangeStreamHistoryLost` on its next read. The hub also retains a
//! ring of recent events for resumption.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::EngineError;
use crate::handle::Handle;
use crate::oplog::{Event, OperationType, ResumeToken};

/// Options for opening a change stream.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Replay retained events strictly after this token.
    pub resume_after: Option<ResumeToken>,
    /// Same replay semantics as `resume_after`.
    pub start_after: Option<ResumeToken>,
    /// Replay retained events at or after this cluster-time second.
    pub start_at_operation_time: Option<u32>,
    /// Subscriber buffer capacity.
    pub buffer: usize,
}

impl Default for WatchOptions {
    fn default() -> WatchOptions {
        WatchOptions {
            resume_after: None,
            start_after: None,
            start_at_operation_time: None,
            buffer: 1024,
        }
    }
}

pub(crate) struct Hub {
    state: Mutex<HubState>,
    retain: usize,
}

struct HubState {
    retained: VecDeque<Event>,
    /// Token of the most recently evicted event; resumption before it
    /// has lost history.
    evicted: Option<ResumeToken>,
    subscribers: Vec<Arc<Subscriber>>,
}

impl Hub {
    pub(crate) fn new(retain: usize) -> Hub {
        Hub {
            state: Mutex::new(HubState {
                retained: VecDeque::new(),
                evicted: None,
                subscribers: Vec::new(),
            }),
            retain,
        }
    }

    /// Append a commit's events to the retained oplog and fan them out.
    /// Events of one commit are delivered consecutively in commit order.
    pub(crate) fn publish(&self, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        for event in events {
            state.retained.push_back(event.clone());
            if state.retained.len() > self.retain {
                if let Some(old) = state.retained.pop_front() {
                    state.evicted = Some(old.token);
                }
            }
        }
        state.subscribers.retain(|sub| !sub.is_closed());
        for sub in &state.subscribers {
            sub.deliver(events);
        }
    }

    pub(crate) fn subscribe(
        &self,
        scope: Handle,
        options: WatchOptions,
    ) -> Result<ChangeStream, EngineError> {
        let mut state = self.state.lock().unwrap();

        let after = options.resume_after.or(options.start_after);
        if let (Some(token), Some(evicted)) = (&after, &state.evicted) {
            if token < evicted {
                return Err(EngineError::ChangeStreamHistoryLost);
            }
        }
        if let (Some(ts), Some(evicted)) = (options.start_at_operation_time, &state.evicted) {
            if evicted.time >= ts {
                return Err(EngineError::ChangeStreamHistoryLost);
            }
        }

        let subscriber = Arc::new(Subscriber::new(scope, options.buffer.max(1)));
        if after.is_some() || options.start_at_operation_time.is_some() {
            let seed: Vec<Event> = state
                .retained
                .iter()
                .filter(|event| match (&after, options.start_at_operation_time) {
                    (Some(token), _) => event.token > *token,
                    (None, Some(ts)) => event.token.time >= ts,
                    (None, None) => false,
                })
                .cloned()
                .collect();
            subscriber.deliver(&seed);
        }
        state.subscribers.push(Arc::clone(&subscriber));

        Ok(ChangeStream { subscriber })
    }

    /// Close every subscriber; used when the engine shuts down.
    pub(crate) fn shutdown(&self) {
        let state = self.state.lock().unwrap();
        for sub in &state.subscribers {
            sub.close();
        }
    }
}

struct Subscriber {
    scope: Handle,
    capacity: usize,
    queue: Mutex<Queue>,
    signal: Condvar,
}

#[derive(Default)]
struct Queue {
    events: VecDeque<Event>,
    lagged: bool,
    /// An invalidate has been queued; close once the queue drains.
    closing: bool,
    closed: bool,
}

impl Subscriber {
    fn new(scope: Handle, capacity: usize) -> Subscriber {
        Subscriber {
            scope,
            capacity,
            queue: Mutex::new(Queue::default()),
            signal: Condvar::new(),
        }
    }

    fn is_closed(&self) -> bool {
        self.queue.lock().unwrap().closed
    }

    fn close(&self) {
        self.queue.lock().unwrap().closed = true;
        self.signal.notify_all();
    }

    fn deliver(&self, events: &[Event]) {
        let mut queue = self.queue.lock().unwrap();
        for event in events {
            if queue.closed || queue.closing || queue.lagged {
                break;
            }
            if !self.relevant(event) {
                continue;
            }
            if queue.events.len() >= self.capacity {
                queue.lagged = true;
                warn!(scope = %self.scope, "change stream subscriber lagged, dropping");
                break;
            }
            queue.events.push_back(event.clone());
            if self.invalidated_by(event) {
                queue.events.push_back(Event {
                    token: event.token.clone(),
                    namespace: event.namespace.clone(),
                    operation: OperationType::Invalidate,
                    document_key: None,
                    full_document: None,
                    update_description: None,
                });
                queue.closing = true;
            }
        }
        drop(queue);
        self.signal.notify_all();
    }

    fn relevant(&self, event: &Event) -> bool {
        match event.operation {
            // a database drop reaches every stream watching inside it
            OperationType::DropDatabase => {
                self.scope.is_cluster() || self.scope.database == event.namespace.database
            }
            _ => self.scope.contains(&event.namespace),
        }
    }

    fn invalidated_by(&self, event: &Event) -> bool {
        match event.operation {
            OperationType::Drop => {
                self.scope.is_collection() && self.scope == event.namespace
            }
            OperationType::DropDatabase => {
                !self.scope.is_cluster() && self.scope.database == event.namespace.database
            }
            _ => false,
        }
    }
}

/// A handle to one subscription. Events arrive in commit order; reads
/// poll with [`try_next`](ChangeStream::try_next) or block with
/// [`next_timeout`](ChangeStream::next_timeout).
pub struct ChangeStream {
    subscriber: Arc<Subscriber>,
}

impl ChangeStream {
    pub fn try_next(&self) -> Result<Option<Event>, EngineError> {
        let mut queue = self.subscriber.queue.lock().unwrap();
        Self::pop(&mut queue)
    }

    pub fn next_timeout(&self, timeout: Duration) -> Result<Option<Event>, EngineError> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.subscriber.queue.lock().unwrap();
        loop {
            match Self::pop(&mut queue)? {
                Some(event) => return Ok(Some(event)),
                None if queue.closed => return Ok(None),
                None => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .subscriber
                .signal
                .wait_timeout(queue, deadline - now)
                .unwrap();
            queue = guard;
        }
    }

    fn pop(queue: &mut Queue) -> Result<Option<Event>, EngineError> {
        if let Some(event) = queue.events.pop_front() {
            if event.operation == OperationType::Invalidate {
                queue.closed = true;
            } else if queue.closing && queue.events.is_empty() {
                queue.closed = true;
            }
            return Ok(Some(event));
        }
        if queue.lagged {
            queue.closed = true;
            return Err(EngineError::ChangeStreamHistoryLost);
        }
        Ok(None)
    }

    pub fn close(&self) {
        self.subscriber.close();
    }

    pub fn is_closed(&self) -> bool {
        self.subscriber.is_closed()
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.subscriber.close();
    }
}
