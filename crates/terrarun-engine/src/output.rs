// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live command output.
//!
//! An [`Output`] is an append-only text buffer with a completion flag. Every
//! mutation wakes every subscriber; readers take a [`OutputSnapshot`] after
//! each wake and diff the content length themselves, like `tail -f`.
//!
//! ```rust,ignore
//! let subscriber = output.subscribe();
//! let mut seen = 0;
//! loop {
//!     let snapshot = output.snapshot();
//!     print!("{}", &snapshot.content[seen..]);
//!     seen = snapshot.content.len();
//!     if snapshot.complete {
//!         break;
//!     }
//!     subscriber.changed().await;
//! }
//! output.unsubscribe(&subscriber);
//! ```

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

/// Consistent view of an output buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSnapshot {
    /// Everything written so far, one `\n` after each line.
    pub content: String,
    /// Whether the producer finished.
    pub complete: bool,
}

/// Handle returned by [`Output::subscribe`].
#[derive(Debug)]
pub struct OutputSubscriber {
    id: u64,
    notify: Arc<Notify>,
}

impl OutputSubscriber {
    /// Wait for the next change.
    ///
    /// A change that happened since the previous call completes this
    /// immediately, so wakeups between snapshots are never lost.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}

#[derive(Default)]
struct OutputState {
    content: String,
    complete: bool,
    subscribers: HashMap<u64, Arc<Notify>>,
    next_subscriber: u64,
}

impl OutputState {
    fn wake_all(&self) {
        for notify in self.subscribers.values() {
            notify.notify_one();
        }
    }
}

/// Append-only multi-reader output buffer.
pub struct Output {
    id: Uuid,
    state: Mutex<OutputState>,
}

impl Output {
    /// Create an empty buffer.
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            state: Mutex::new(OutputState::default()),
        }
    }

    /// Identifier of the plan or apply this buffer belongs to.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Append a line and wake every subscriber.
    pub fn add_line(&self, line: &str) {
        let mut state = self.state.lock();
        state.content.push_str(line);
        state.content.push('\n');
        state.wake_all();
    }

    /// Mark the stream finished and wake every subscriber.
    pub fn set_completed(&self) {
        let mut state = self.state.lock();
        state.complete = true;
        state.wake_all();
    }

    /// Register a new reader.
    pub fn subscribe(&self) -> OutputSubscriber {
        let mut state = self.state.lock();
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        let notify = Arc::new(Notify::new());
        state.subscribers.insert(id, notify.clone());
        OutputSubscriber { id, notify }
    }

    /// Remove a reader.
    pub fn unsubscribe(&self, subscriber: &OutputSubscriber) {
        self.state.lock().subscribers.remove(&subscriber.id);
    }

    /// Number of registered readers.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Content and completion flag read under one lock.
    pub fn snapshot(&self) -> OutputSnapshot {
        let state = self.state.lock();
        OutputSnapshot {
            content: state.content.clone(),
            complete: state.complete,
        }
    }

    /// Whether [`set_completed`](Self::set_completed) was called.
    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    /// Wait until the buffer is complete and return its content.
    pub async fn wait_until_complete(&self) -> String {
        let subscriber = self.subscribe();
        let content = loop {
            let snapshot = self.snapshot();
            if snapshot.complete {
                break snapshot.content;
            }
            subscriber.changed().await;
        };
        self.unsubscribe(&subscriber);
        content
    }
}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Output")
            .field("id", &self.id)
            .field("len", &state.content.len())
            .field("complete", &state.complete)
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

/// Output buffers keyed by plan/apply id. Entries live until removed or
/// [retired](OutputRegistry::retire).
#[derive(Debug, Default)]
pub struct OutputRegistry {
    outputs: DashMap<Uuid, Arc<Output>>,
}

impl OutputRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the buffer for `id`, creating it if needed.
    pub fn get_or_add(&self, id: Uuid) -> Arc<Output> {
        self.outputs
            .entry(id)
            .or_insert_with(|| Arc::new(Output::new(id)))
            .value()
            .clone()
    }

    /// Get an existing buffer.
    pub fn get(&self, id: Uuid) -> Option<Arc<Output>> {
        self.outputs.get(&id).map(|entry| entry.value().clone())
    }

    /// Drop a buffer. Readers holding an `Arc` keep their copy.
    pub fn remove(&self, id: Uuid) -> Option<Arc<Output>> {
        self.outputs.remove(&id).map(|(_, output)| output)
    }

    /// Drop a finished buffer from the registry.
    ///
    /// Without subscribers it goes immediately; otherwise it stays readable
    /// for `grace` first. A newer buffer registered under the same id is
    /// left alone.
    pub fn retire(self: &Arc<Self>, output: &Arc<Output>, grace: Duration) {
        if output.subscriber_count() == 0 || grace.is_zero() {
            self.remove_if_current(output);
            return;
        }
        let registry = self.clone();
        let output = output.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.remove_if_current(&output);
        });
    }

    fn remove_if_current(&self, output: &Arc<Output>) {
        let removed = self
            .outputs
            .remove_if(&output.id(), |_, current| Arc::ptr_eq(current, output));
        if removed.is_some() {
            debug!(output_id = %output.id(), "Output retired");
        }
    }

    /// Number of live buffers.
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    /// Whether no buffers are registered.
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_line_appends_newline() {
        let output = Output::new(Uuid::new_v4());
        output.add_line("Initializing...");
        output.add_line("");
        assert_eq!(output.snapshot().content, "Initializing...\n\n");
        assert!(!output.is_complete());
    }

    #[test]
    fn test_registry_get_or_add_is_shared() {
        let registry = OutputRegistry::new();
        let id = Uuid::new_v4();
        let a = registry.get_or_add(id);
        a.add_line("hello");
        let b = registry.get(id).unwrap();
        assert_eq!(b.snapshot().content, "hello\n");

        let removed = registry.remove(id).unwrap();
        assert!(Arc::ptr_eq(&a, &removed));
        assert!(registry.get(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_retire_without_readers_is_immediate() {
        let registry = Arc::new(OutputRegistry::new());
        let output = registry.get_or_add(Uuid::new_v4());
        output.set_completed();

        registry.retire(&output, Duration::from_secs(60));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retire_keeps_output_for_readers() {
        let registry = Arc::new(OutputRegistry::new());
        let id = Uuid::new_v4();
        let output = registry.get_or_add(id);
        let reader = output.subscribe();
        output.add_line("Apply complete!");
        output.set_completed();

        registry.retire(&output, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(registry.get(id).is_some());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(registry.is_empty());
        // The reader keeps its own handle.
        assert_eq!(output.snapshot().content, "Apply complete!\n");
        output.unsubscribe(&reader);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retire_spares_newer_buffer() {
        let registry = Arc::new(OutputRegistry::new());
        let id = Uuid::new_v4();
        let old = registry.get_or_add(id);
        let _reader = old.subscribe();
        registry.retire(&old, Duration::from_secs(5));

        registry.remove(id);
        let newer = registry.get_or_add(id);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(Arc::ptr_eq(&registry.get(id).unwrap(), &newer));
    }

    #[test]
    fn test_unsubscribe() {
        let output = Output::new(Uuid::new_v4());
        let a = output.subscribe();
        let b = output.subscribe();
        assert_eq!(output.subscriber_count(), 2);
        output.unsubscribe(&a);
        output.unsubscribe(&b);
        assert_eq!(output.subscriber_count(), 0);
    }
}
