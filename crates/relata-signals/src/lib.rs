//! # relata-signals
//!
//! Async signal dispatcher for relata. A [`Signal`] holds an ordered,
//! deduplicated list of receivers; [`Signal::send`] runs every receiver
//! concurrently and resolves once all of them finish or the first one fails.
//! A [`SignalTable`] maps [`SignalKind`]s to signals and is owned by each
//! model schema.
//!
//! ## Usage
//!
//! ```
//! use relata_signals::{Signal, SignalKind, SignalTable};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! # futures::executor::block_on(async {
//! let table: SignalTable<String> = SignalTable::new();
//! let hits = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&hits);
//!
//! table
//!     .connect(SignalKind::PostSave, "count", move |_payload: String| {
//!         let counter = Arc::clone(&counter);
//!         async move {
//!             counter.fetch_add(1, Ordering::SeqCst);
//!             Ok(())
//!         }
//!     })
//!     .unwrap();
//!
//! table.send(&SignalKind::PostSave, "book".to_string()).await.unwrap();
//! assert_eq!(hits.load(Ordering::SeqCst), 1);
//! # });
//! ```
//!
//! Connecting and disconnecting are safe at any time, but receivers connected
//! while an emission is in flight only take part in later emissions.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::{try_join_all, BoxFuture};
use parking_lot::RwLock;
use relata_core::{RelataError, RelataResult};

/// The future returned by a receiver.
pub type ReceiverFuture = BoxFuture<'static, RelataResult<()>>;

/// The type signature for a signal receiver.
///
/// Receivers take an owned clone of the payload and return a boxed future.
/// They must be `Send + Sync` so that signals can be dispatched from any task.
pub type Receiver<T> = Arc<dyn Fn(T) -> ReceiverFuture + Send + Sync>;

/// Wraps an async closure into a [`Receiver`].
pub fn receiver<T, F, Fut>(f: F) -> Receiver<T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RelataResult<()>> + Send + 'static,
{
    Arc::new(move |payload: T| -> ReceiverFuture { Box::pin(f(payload)) })
}

/// A signal that can be connected to and dispatched.
pub struct Signal<T> {
    name: String,
    receivers: RwLock<Vec<(String, Receiver<T>)>>,
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.name)
            .field("receivers", &self.receivers.read().len())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Signal<T> {
    /// Creates a new signal with no connected receivers.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            receivers: RwLock::new(Vec::new()),
        }
    }

    /// Returns the signal name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connects a receiver under a dispatch uid.
    ///
    /// A receiver registered again under the same uid replaces the previous
    /// one in place. The same receiver object registered under a second uid
    /// is ignored, so each callable runs at most once per emission.
    pub fn connect(&self, dispatch_uid: impl Into<String>, receiver: Receiver<T>) -> RelataResult<()> {
        let uid = dispatch_uid.into();
        if uid.trim().is_empty() {
            return Err(RelataError::SignalDefinition(format!(
                "receiver for '{}' needs a non-empty dispatch uid",
                self.name
            )));
        }

        let mut receivers = self.receivers.write();
        if let Some(entry) = receivers.iter_mut().find(|(id, _)| *id == uid) {
            entry.1 = receiver;
        } else if !receivers.iter().any(|(_, r)| same_receiver(r, &receiver)) {
            receivers.push((uid, receiver));
        }
        Ok(())
    }

    /// Connects an async closure under a dispatch uid.
    pub fn connect_fn<F, Fut>(&self, dispatch_uid: impl Into<String>, f: F) -> RelataResult<()>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RelataResult<()>> + Send + 'static,
    {
        self.connect(dispatch_uid, receiver(f))
    }

    /// Disconnects the receiver with the given uid.
    ///
    /// Returns `true` if a receiver was found and removed.
    pub fn disconnect(&self, dispatch_uid: &str) -> bool {
        let mut receivers = self.receivers.write();
        let len_before = receivers.len();
        receivers.retain(|(id, _)| id != dispatch_uid);
        receivers.len() < len_before
    }

    /// Removes every receiver.
    pub fn clear(&self) {
        self.receivers.write().clear();
    }

    /// Sends the payload to all connected receivers.
    ///
    /// Receivers run concurrently. The call resolves when every receiver has
    /// completed, or with the first error raised by any of them.
    pub async fn send(&self, payload: T) -> RelataResult<()> {
        let receivers: Vec<Receiver<T>> = self
            .receivers
            .read()
            .iter()
            .map(|(_, r)| Arc::clone(r))
            .collect();
        if receivers.is_empty() {
            return Ok(());
        }

        tracing::trace!(signal = %self.name, receivers = receivers.len(), "dispatching signal");
        try_join_all(receivers.iter().map(|r| r(payload.clone()))).await?;
        Ok(())
    }

    /// Returns the number of connected receivers.
    pub fn receiver_count(&self) -> usize {
        self.receivers.read().len()
    }

    /// Returns `true` if a receiver is connected under `dispatch_uid`.
    pub fn has_receiver(&self, dispatch_uid: &str) -> bool {
        self.receivers.read().iter().any(|(id, _)| id == dispatch_uid)
    }
}

fn same_receiver<T>(a: &Receiver<T>, b: &Receiver<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

// ── Signal kinds ─────────────────────────────────────────────────────

/// The lifecycle events a model can emit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Before an instance is inserted.
    PreSave,
    /// After an instance is inserted.
    PostSave,
    /// Before an instance is updated.
    PreUpdate,
    /// After an instance is updated.
    PostUpdate,
    /// Before an instance is deleted.
    PreDelete,
    /// After an instance is deleted.
    PostDelete,
    /// Before a row joins a to-many relation.
    PreRelationAdd,
    /// After a row joins a to-many relation.
    PostRelationAdd,
    /// Before a row leaves a to-many relation.
    PreRelationRemove,
    /// After a row leaves a to-many relation.
    PostRelationRemove,
    /// Once per bulk update, with every updated instance.
    BulkPostUpdate,
    /// An application-defined event.
    Custom(String),
}

impl SignalKind {
    /// Every built-in kind, in lifecycle order.
    pub const BUILTIN: [Self; 11] = [
        Self::PreSave,
        Self::PostSave,
        Self::PreUpdate,
        Self::PostUpdate,
        Self::PreDelete,
        Self::PostDelete,
        Self::PreRelationAdd,
        Self::PostRelationAdd,
        Self::PreRelationRemove,
        Self::PostRelationRemove,
        Self::BulkPostUpdate,
    ];

    /// Returns the snake_case event name.
    pub fn name(&self) -> &str {
        match self {
            Self::PreSave => "pre_save",
            Self::PostSave => "post_save",
            Self::PreUpdate => "pre_update",
            Self::PostUpdate => "post_update",
            Self::PreDelete => "pre_delete",
            Self::PostDelete => "post_delete",
            Self::PreRelationAdd => "pre_relation_add",
            Self::PostRelationAdd => "post_relation_add",
            Self::PreRelationRemove => "pre_relation_remove",
            Self::PostRelationRemove => "post_relation_remove",
            Self::BulkPostUpdate => "bulk_post_update",
            Self::Custom(name) => name,
        }
    }

    /// Creates a custom kind, rejecting empty names and built-in names.
    pub fn custom(name: impl Into<String>) -> RelataResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RelataError::SignalDefinition(
                "custom signal name cannot be empty".to_string(),
            ));
        }
        if Self::BUILTIN.iter().any(|k| k.name() == name) {
            return Err(RelataError::SignalDefinition(format!(
                "'{name}' is a built-in signal and cannot be redefined as custom"
            )));
        }
        Ok(Self::Custom(name))
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SignalKind {
    type Err = RelataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::BUILTIN
            .iter()
            .find(|k| k.name() == s)
            .cloned()
            .map_or_else(|| Self::custom(s), Ok)
    }
}

// ── Signal table ─────────────────────────────────────────────────────

/// A mapping from signal kind to signal, created on first use.
pub struct SignalTable<T> {
    signals: RwLock<HashMap<SignalKind, Arc<Signal<T>>>>,
}

impl<T> fmt::Debug for SignalTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let signals = self.signals.read();
        let mut names: Vec<&str> = signals.keys().map(SignalKind::name).collect();
        names.sort_unstable();
        f.debug_struct("SignalTable").field("signals", &names).finish()
    }
}

impl<T: Clone + Send + 'static> Default for SignalTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> SignalTable<T> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            signals: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the signal for `kind`, creating it if needed.
    pub fn signal(&self, kind: &SignalKind) -> Arc<Signal<T>> {
        if let Some(signal) = self.signals.read().get(kind) {
            return Arc::clone(signal);
        }
        let mut signals = self.signals.write();
        Arc::clone(
            signals
                .entry(kind.clone())
                .or_insert_with(|| Arc::new(Signal::new(kind.name()))),
        )
    }

    /// Connects an async closure to the signal for `kind`.
    pub fn connect<F, Fut>(
        &self,
        kind: SignalKind,
        dispatch_uid: impl Into<String>,
        f: F,
    ) -> RelataResult<()>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RelataResult<()>> + Send + 'static,
    {
        self.signal(&kind).connect_fn(dispatch_uid, f)
    }

    /// Disconnects a receiver from the signal for `kind`.
    pub fn disconnect(&self, kind: &SignalKind, dispatch_uid: &str) -> bool {
        self.signals
            .read()
            .get(kind)
            .is_some_and(|signal| signal.disconnect(dispatch_uid))
    }

    /// Sends `payload` on the signal for `kind`; a kind nobody listens to is a no-op.
    pub async fn send(&self, kind: &SignalKind, payload: T) -> RelataResult<()> {
        let signal = self.signals.read().get(kind).cloned();
        match signal {
            Some(signal) => signal.send(payload).await,
            None => Ok(()),
        }
    }

    /// Returns the number of receivers connected for `kind`.
    pub fn receiver_count(&self, kind: &SignalKind) -> usize {
        self.signals
            .read()
            .get(kind)
            .map_or(0, |signal| signal.receiver_count())
    }

    /// Removes every receiver from every signal.
    pub fn reset(&self) {
        for signal in self.signals.read().values() {
            signal.clear();
        }
    }
}
