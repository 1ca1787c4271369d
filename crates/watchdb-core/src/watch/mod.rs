//! Module: watch
//! Responsibility: translate the raw change feed of one key or key prefix
//! into typed, deduplicated events for a single consumer.
//! Does not own: the subscription itself (the store does) or event retention.
//!
//! Invariants:
//! - Events are delivered in store commit order.
//! - A put whose payload matches the last one delivered for that key is
//!   suppressed; deletes are always delivered.
//! - A decode failure yields `Event::Error` and the stream continues; a store
//!   failure yields a terminal `Event::Error` and the stream ends.


use crate::{
    error::InternalError,
    obs::sink::{self, MetricsEvent},
    schema::{Schema, key::id_after_prefix},
    store::{CoordinationStore, KeyValue, RawEvent, RawWatchStream, Revision, WatchTarget},
};
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

///
/// Event
///

#[derive(Debug)]
pub enum Event<T> {
    Put {
        id: String,
        item: T,
        revision: Revision,
    },
    Delete {
        id: String,
        revision: Revision,
    },
    Error(InternalError),
}

impl<T> Event<T> {
    /// Record id the event refers to, if any.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Put { id, .. } | Self::Delete { id, .. } => Some(id),
            Self::Error(_) => None,
        }
    }
}

///
/// WatchScope
/// Which keys a watcher follows and how a key maps back to a record id.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum WatchScope {
    /// Every record of the collection; index entries are skipped.
    Collection,

    /// One record key.
    Record { id: String },

    /// Entries of one index value.
    IndexValue { prefix: String },
}

impl WatchScope {
    fn target<T>(&self, schema: &Schema<T>) -> WatchTarget {
        match self {
            Self::Collection => WatchTarget::Prefix(schema.namespace().to_string()),
            Self::Record { id } => WatchTarget::Key(schema.keys().primary(id)),
            Self::IndexValue { prefix } => WatchTarget::Prefix(prefix.clone()),
        }
    }

    fn record_id<'k, T>(&self, schema: &Schema<T>, key: &'k str) -> Option<&'k str> {
        match self {
            Self::Collection => schema.keys().record_id(key),
            Self::Record { id } => schema.keys().record_id(key).filter(|found| *found == id.as_str()),
            Self::IndexValue { prefix } => id_after_prefix(prefix, key),
        }
    }
}

///
/// Watcher
///
/// Consumer end of one subscription. Dropping it (or calling `close`)
/// stops the translator task and releases the store subscription.
///

pub struct Watcher<T> {
    rx: mpsc::Receiver<Event<T>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<T> Watcher<T> {
    /// Next event, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Event<T>> {
        self.rx.recv().await
    }

    /// Next event if one is already buffered.
    pub fn try_next(&mut self) -> Option<Event<T>> {
        self.rx.try_recv().ok()
    }

    /// Stop the translator and wait for it to release its subscription.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
        {
            warn!(error = %err, "watch translator ended abnormally");
        }
    }
}

impl<T> Drop for Watcher<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

///
/// Translator
///

struct Translator<T> {
    schema: Arc<Schema<T>>,
    scope: WatchScope,
    tx: mpsc::Sender<Event<T>>,
    cancel: CancellationToken,
    delivered: HashMap<String, Vec<u8>>,
}

impl<T: Send + 'static> Translator<T> {
    // False once the consumer is gone or the watcher was cancelled.
    async fn emit(&self, event: Event<T>) -> bool {
        let namespace = self.schema.namespace();
        match &event {
            Event::Error(_) => sink::record(MetricsEvent::WatchError { namespace }),
            _ => sink::record(MetricsEvent::WatchEvent { namespace }),
        }

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    async fn put(&mut self, kv: KeyValue) -> bool {
        let Some(id) = self.scope.record_id(&self.schema, &kv.key) else {
            return true;
        };
        if let Some(last) = self.delivered.get(&kv.key)
            && self.schema.codec().equivalent(last, &kv.value)
        {
            return true;
        }

        match self.schema.decode(&kv.value) {
            Ok(item) => {
                let event = Event::Put {
                    id: id.to_string(),
                    item,
                    revision: kv.mod_revision,
                };
                self.delivered.insert(kv.key, kv.value);

                self.emit(event).await
            }
            Err(err) => {
                warn!(key = %kv.key, error = %err, "undecodable payload on change feed");
                self.emit(Event::Error(err)).await
            }
        }
    }

    async fn delete(&mut self, key: String, revision: Revision) -> bool {
        let Some(id) = self.scope.record_id(&self.schema, &key) else {
            return true;
        };
        let event = Event::Delete {
            id: id.to_string(),
            revision,
        };
        self.delivered.remove(&key);

        self.emit(event).await
    }

    async fn run(mut self, replay: Vec<KeyValue>, mut feed: RawWatchStream) {
        for kv in replay {
            if !self.put(kv).await {
                return;
            }
        }

        loop {
            let raw = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                raw = feed.recv() => raw,
            };

            let open = match raw {
                Some(Ok(RawEvent::Put(kv))) => self.put(kv).await,
                Some(Ok(RawEvent::Delete { key, revision })) => self.delete(key, revision).await,
                Some(Err(err)) => {
                    warn!(error = %err, "change feed failed");
                    self.emit(Event::Error(err.into())).await;
                    break;
                }
                None => {
                    let err = InternalError::store_unavailable("change feed closed by the store");
                    self.emit(Event::Error(err)).await;
                    break;
                }
            };
            if !open {
                break;
            }
        }

        debug!(namespace = self.schema.namespace(), "watch translator stopped");
    }
}

/// Open a watcher over `scope`, replaying its contents at `at` (the head when
/// `None`) before following the change feed from the next revision.
pub(crate) async fn open<T, S>(
    store: &Arc<S>,
    schema: &Arc<Schema<T>>,
    scope: WatchScope,
    at: Option<Revision>,
    buffer: usize,
    parent: Option<&CancellationToken>,
) -> Result<Watcher<T>, InternalError>
where
    T: Send + 'static,
    S: CoordinationStore,
{
    let at = match at {
        Some(revision) => revision,
        None => store.head().await?,
    };
    let target = scope.target(schema);
    let replay: Vec<KeyValue> = match &target {
        WatchTarget::Key(key) => store.get(key, Some(at)).await?.into_iter().collect(),
        WatchTarget::Prefix(prefix) => store.range(prefix, Some(at)).await?.kvs,
    };
    let feed = store.watch(target, at.next()).await?;

    let cancel = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
    let (tx, rx) = mpsc::channel(buffer);
    let translator = Translator {
        schema: schema.clone(),
        scope,
        tx,
        cancel: cancel.clone(),
        delivered: HashMap::new(),
    };

    sink::record(MetricsEvent::WatchOpened {
        namespace: schema.namespace(),
    });
    debug!(namespace = schema.namespace(), %at, "watch opened");
    let task = tokio::spawn(translator.run(replay, feed));

    Ok(Watcher {
        rx,
        cancel,
        task: Some(task),
    })
}
