//! Calls, tasks and the handles callers wait on.

use crate::error::{FarmError, Result};
use crate::worker::WorkerId;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

/// A method invocation. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub method: String,
    pub args: Vec<Value>,
}

impl CallRequest {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }
}

type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct ListenerSet {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
    /// Set once the call settled; later subscriptions are ignored
    closed: bool,
}

/// Custom-message listeners attached to one call.
#[derive(Default)]
pub struct Listeners {
    inner: Mutex<ListenerSet>,
}

impl Listeners {
    fn add(&self, listener: Listener) -> Option<u64> {
        let mut set = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if set.closed {
            return None;
        }
        set.next_id += 1;
        let id = set.next_id;
        set.entries.push((id, listener));
        Some(id)
    }

    fn remove(&self, id: u64) {
        let mut set = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        set.entries.retain(|(entry_id, _)| *entry_id != id);
    }

    /// Invoke every current listener. Listeners run outside the lock.
    pub fn emit(&self, payload: &Value) {
        let listeners: Vec<Listener> = {
            let set = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            set.entries.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in listeners {
            listener(payload);
        }
    }

    fn close(&self) {
        let mut set = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        set.closed = true;
        set.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A call plus its scheduling metadata.
pub struct Task {
    pub seq: u64,
    pub request: CallRequest,
    /// Affinity key, if the farm has a key function and it returned one
    pub hash: Option<String>,
    processed: AtomicBool,
    listeners: Arc<Listeners>,
    reply: Sender<Result<Value>>,
}

impl Task {
    /// Create a task and the handle its caller waits on.
    pub fn new(seq: u64, request: CallRequest, hash: Option<String>) -> (Self, WorkHandle) {
        let (reply, receiver) = bounded(1);
        let listeners = Arc::new(Listeners::default());
        let handle = WorkHandle {
            method: request.method.clone(),
            receiver,
            listeners: Arc::clone(&listeners),
        };
        let task = Self {
            seq,
            request,
            hash,
            processed: AtomicBool::new(false),
            listeners,
            reply,
        };
        (task, handle)
    }

    pub fn is_processed(&self) -> bool {
        self.processed.load(Ordering::SeqCst)
    }

    /// Flip `processed`. Returns the previous value.
    pub fn mark_processed(&self) -> bool {
        self.processed.swap(true, Ordering::SeqCst)
    }

    /// Bind this task's affinity key to `worker`. The first binding wins.
    pub fn on_start(&self, affinity: &mut HashMap<String, WorkerId>, worker: WorkerId) {
        if let Some(ref hash) = self.hash {
            affinity.entry(hash.clone()).or_insert(worker);
        }
    }

    /// Forward a custom message to the caller's listeners.
    pub fn emit(&self, payload: &Value) {
        self.listeners.emit(payload);
    }

    /// Clear the listeners and settle the caller's handle.
    pub fn finish(&self, result: Result<Value>) {
        self.listeners.close();
        // The caller may have dropped the handle
        let _ = self.reply.try_send(result);
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("seq", &self.seq)
            .field("method", &self.request.method)
            .field("hash", &self.hash)
            .field("processed", &self.is_processed())
            .finish()
    }
}

/// Pending result of a call.
///
/// Custom messages emitted while the call runs are delivered to listeners
/// registered with [`WorkHandle::on_custom_message`]. The result is yielded
/// at most once.
pub struct WorkHandle {
    method: String,
    receiver: Receiver<Result<Value>>,
    listeners: Arc<Listeners>,
}

impl WorkHandle {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Block until the call settles.
    pub fn wait(self) -> Result<Value> {
        self.receiver.recv().unwrap_or(Err(FarmError::Ended))
    }

    /// Block for at most `timeout`. `None` means the call has not settled yet.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Value>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(FarmError::Ended)),
        }
    }

    /// Non-blocking check for the result.
    pub fn try_result(&self) -> Option<Result<Value>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(FarmError::Ended)),
        }
    }

    /// Register a listener for custom messages emitted by this call.
    pub fn on_custom_message<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.listeners.add(Arc::new(listener));
        Subscription {
            listeners: Arc::downgrade(&self.listeners),
            id,
        }
    }
}

impl std::fmt::Debug for WorkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkHandle")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

/// Keeps a custom-message listener registered until [`unsubscribe`](Self::unsubscribe).
#[derive(Debug)]
pub struct Subscription {
    listeners: Weak<Listeners>,
    id: Option<u64>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let (Some(listeners), Some(id)) = (self.listeners.upgrade(), self.id) {
            listeners.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(hash: Option<&str>) -> (Task, WorkHandle) {
        Task::new(
            1,
            CallRequest::new("echo", vec![json!("hi")]),
            hash.map(String::from),
        )
    }

    #[test]
    fn test_finish_settles_handle_once() {
        let (task, handle) = task(None);
        assert!(handle.try_result().is_none());

        task.finish(Ok(json!("hi")));
        task.finish(Ok(json!("again")));

        assert_eq!(handle.try_result().unwrap().unwrap(), json!("hi"));
        assert!(handle.try_result().is_none());
    }

    #[test]
    fn test_dropped_task_resolves_ended() {
        let (task, handle) = task(None);
        drop(task);
        assert!(matches!(handle.wait(), Err(FarmError::Ended)));
    }

    #[test]
    fn test_wait_timeout_pending() {
        let (_task, handle) = task(None);
        assert!(handle.wait_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_mark_processed_flips_once() {
        let (task, _handle) = task(None);
        assert!(!task.mark_processed());
        assert!(task.mark_processed());
        assert!(task.is_processed());
    }

    #[test]
    fn test_affinity_first_writer_wins() {
        let mut affinity = HashMap::new();
        let (first, _h1) = task(Some("x"));
        let (second, _h2) = task(Some("x"));
        first.on_start(&mut affinity, 1);
        second.on_start(&mut affinity, 0);
        assert_eq!(affinity.get("x"), Some(&1));

        let (unkeyed, _h3) = task(None);
        unkeyed.on_start(&mut affinity, 0);
        assert_eq!(affinity.len(), 1);
    }

    #[test]
    fn test_listeners_and_unsubscribe() {
        let (task, handle) = task(None);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let sub = handle.on_custom_message(move |v| sink.lock().unwrap().push(v.clone()));
        task.emit(&json!(1));
        sub.unsubscribe();
        task.emit(&json!(2));

        assert_eq!(*seen.lock().unwrap(), vec![json!(1)]);
    }

    #[test]
    fn test_listeners_cleared_on_finish() {
        let (task, handle) = task(None);
        let _sub = handle.on_custom_message(|_| {});
        task.finish(Ok(Value::Null));

        let _late = handle.on_custom_message(|_| {});
        assert!(task.listeners.is_empty());
    }
}
