use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use derive_more::From;
use tokio::sync::Notify;

use crate::{
    event::{cmap::CmapEvent, sdam::SdamEvent, server_selection::ServerSelectionEvent},
    options::TopologyOptions,
    runtime,
};

#[derive(Clone, Debug, From)]
#[allow(clippy::large_enum_variant)]
pub(crate) enum Event {
    Cmap(CmapEvent),
    Sdam(SdamEvent),
    ServerSelection(ServerSelectionEvent),
}

/// A buffer of events that provides utility methods for querying the buffer and awaiting new event
/// arrival.
#[derive(Clone, Debug)]
pub(crate) struct EventBuffer<T = Event> {
    inner: Arc<EventBufferInner<T>>,
}

#[derive(Debug)]
struct EventBufferInner<T> {
    events: Mutex<Vec<T>>,
    event_received: Notify,
}

impl<T> EventBuffer<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(EventBufferInner {
                events: Mutex::new(Vec::new()),
                event_received: Notify::new(),
            }),
        }
    }

    pub(crate) fn filter_map<R>(&self, f: impl Fn(&T) -> Option<R>) -> Vec<R> {
        self.inner.events.lock().unwrap().iter().filter_map(f).collect()
    }

    /// Create a new stream view of events buffered after the point of this call.
    pub(crate) fn stream(&self) -> EventStream<'_, T> {
        let index = self.inner.events.lock().unwrap().len();
        EventStream {
            buffer: self,
            index,
        }
    }

    /// Create a new stream view, starting with events already contained in the buffer.
    pub(crate) fn stream_all(&self) -> EventStream<'_, T> {
        EventStream {
            buffer: self,
            index: 0,
        }
    }

    pub(crate) fn push_event(&self, ev: T) {
        self.inner.events.lock().unwrap().push(ev);
        self.inner.event_received.notify_waiters();
    }
}

impl<T: Clone> EventBuffer<T> {
    /// Returns a list of current events.
    pub(crate) fn all(&self) -> Vec<T> {
        self.inner.events.lock().unwrap().clone()
    }
}

impl<T: Clone + Send + Sync + 'static> EventBuffer<T> {
    pub(crate) fn handler<V: Into<T> + Send + Sync + 'static>(
        &self,
    ) -> crate::event::EventHandler<V> {
        let this = self.clone();
        crate::event::EventHandler::callback(move |ev: V| this.push_event(ev.into()))
    }
}

impl EventBuffer<Event> {
    pub(crate) fn register(&self, options: &mut TopologyOptions) {
        options.cmap_event_handler = Some(self.handler());
        options.sdam_event_handler = Some(self.handler());
        options.server_selection_event_handler = Some(self.handler());
    }

    pub(crate) fn count_pool_cleared_events(&self) -> usize {
        self.filter_map(|e| matches!(e, Event::Cmap(CmapEvent::PoolCleared(_))).then_some(()))
            .len()
    }
}

/// Iterate one at a time over events in an `EventBuffer`.
pub(crate) struct EventStream<'a, T> {
    buffer: &'a EventBuffer<T>,
    index: usize,
}

impl<T: Clone> EventStream<'_, T> {
    fn try_next(&mut self) -> Option<T> {
        let events = self.buffer.inner.events.lock().unwrap();
        if events.len() > self.index {
            let event = events[self.index].clone();
            self.index += 1;
            return Some(event);
        }
        None
    }

    /// Get the next unread event from the underlying buffer, waiting for a new one to arrive if all
    /// current ones have been read.
    pub(crate) async fn next(&mut self, timeout: Duration) -> Option<T> {
        runtime::timeout(timeout, async move {
            loop {
                let notified = self.buffer.inner.event_received.notified();
                if let Some(next) = self.try_next() {
                    return Some(next);
                }
                notified.await;
            }
        })
        .await
        .unwrap_or(None)
    }

    /// Get the next unread event for which the provided closure returns `Some`, waiting for new
    /// events to arrive if all current ones have been read.
    pub(crate) async fn next_map<F, R>(&mut self, timeout: Duration, mut filter_map: F) -> Option<R>
    where
        F: FnMut(T) -> Option<R>,
    {
        runtime::timeout(timeout, async move {
            loop {
                let ev = self.next(timeout).await?;
                if let Some(r) = filter_map(ev) {
                    return Some(r);
                }
            }
        })
        .await
        .unwrap_or(None)
    }

    /// Get the next unread event for which the provided closure returns `true`, waiting for new
    /// events to arrive if all current ones have been read.
    pub(crate) async fn next_match<F>(&mut self, timeout: Duration, mut filter: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        self.next_map(timeout, |e| if filter(&e) { Some(e) } else { None })
            .await
    }

    /// Collects all unread events matching a predicate without waiting for any more.
    pub(crate) fn collect_now<F>(&mut self, filter: F) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        let events = self.buffer.inner.events.lock().unwrap();
        let out = events
            .iter()
            .skip(self.index)
            .filter(|e| filter(e))
            .cloned()
            .collect();
        self.index = events.len();
        out
    }
}
