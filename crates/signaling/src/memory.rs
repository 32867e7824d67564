//! In-process [`SignalingStore`] implementation.
//!
//! Reproduces the subscription semantics of a hosted realtime store:
//! document subscribers get an immediate snapshot, collection subscribers
//! get every existing item as `Added` before incremental changes. Used by
//! the integration tests and by loopback transfers where both peers live
//! in one process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use crate::store::{
    ChangeKind, CollectionChange, CollectionRef, DocumentId, DocumentRef, DocumentSnapshot,
    Fields, SignalingError, SignalingStore,
};

#[derive(Default)]
struct Inner {
    /// Documents keyed by full path. Insertion order per collection is
    /// preserved so initial snapshots replay in creation order.
    docs: Vec<(String, Fields)>,
    doc_subs: HashMap<String, Vec<mpsc::UnboundedSender<DocumentSnapshot>>>,
    coll_subs: HashMap<String, Vec<mpsc::UnboundedSender<CollectionChange>>>,
}

impl Inner {
    fn find(&self, path: &str) -> Option<&Fields> {
        self.docs
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, f)| f)
    }

    fn find_mut(&mut self, path: &str) -> Option<&mut Fields> {
        self.docs
            .iter_mut()
            .find(|(p, _)| p == path)
            .map(|(_, f)| f)
    }

    fn notify_doc(&mut self, doc: &DocumentRef) {
        let fields = self.find(doc.path()).cloned();
        if let Some(subs) = self.doc_subs.get_mut(doc.path()) {
            subs.retain(|tx| {
                tx.send(DocumentSnapshot {
                    doc: doc.clone(),
                    fields: fields.clone(),
                })
                .is_ok()
            });
        }
    }

    fn notify_collection(&mut self, doc: &DocumentRef, kind: ChangeKind) {
        let Some(fields) = self.find(doc.path()).cloned() else {
            return;
        };
        let parent = doc.parent().to_string();
        let id = doc.id();
        if let Some(subs) = self.coll_subs.get_mut(&parent) {
            subs.retain(|tx| {
                tx.send(CollectionChange {
                    kind,
                    id: id.clone(),
                    fields: fields.clone(),
                })
                .is_ok()
            });
        }
    }
}

/// In-memory signaling store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Poisoning cannot happen: no code path panics while holding the lock.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn create(
        &self,
        collection: &CollectionRef,
        fields: Fields,
    ) -> Result<DocumentId, SignalingError> {
        let id = DocumentId::generate();
        let doc = collection.doc(&id);
        trace!(path = %doc, "create document");

        let mut inner = self.lock();
        inner.docs.push((doc.path().to_string(), fields));
        inner.notify_doc(&doc);
        inner.notify_collection(&doc, ChangeKind::Added);
        Ok(id)
    }

    async fn get(&self, doc: &DocumentRef) -> Result<Option<Fields>, SignalingError> {
        Ok(self.lock().find(doc.path()).cloned())
    }

    async fn merge(&self, doc: &DocumentRef, fields: Fields) -> Result<(), SignalingError> {
        trace!(path = %doc, keys = ?fields.keys().collect::<Vec<_>>(), "merge document");

        let mut inner = self.lock();
        let kind = match inner.find_mut(doc.path()) {
            Some(existing) => {
                for (key, value) in fields {
                    existing.insert(key, value);
                }
                ChangeKind::Modified
            }
            None => {
                inner.docs.push((doc.path().to_string(), fields));
                ChangeKind::Added
            }
        };
        inner.notify_doc(doc);
        inner.notify_collection(doc, kind);
        Ok(())
    }

    async fn subscribe_document(
        &self,
        doc: &DocumentRef,
    ) -> Result<mpsc::UnboundedReceiver<DocumentSnapshot>, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();

        // Immediate snapshot of current state, present or not.
        let fields = inner.find(doc.path()).cloned();
        let _ = tx.send(DocumentSnapshot {
            doc: doc.clone(),
            fields,
        });

        inner
            .doc_subs
            .entry(doc.path().to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn subscribe_collection(
        &self,
        collection: &CollectionRef,
    ) -> Result<mpsc::UnboundedReceiver<CollectionChange>, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();

        // Existing items replay as Added, in creation order.
        let prefix = format!("{}/", collection.path());
        for (path, fields) in &inner.docs {
            let Some(rest) = path.strip_prefix(&prefix) else {
                continue;
            };
            // Direct children only, not nested sub-collection members.
            if rest.contains('/') {
                continue;
            }
            let _ = tx.send(CollectionChange {
                kind: ChangeKind::Added,
                id: DocumentId(rest.to_string()),
                fields: fields.clone(),
            });
        }

        inner
            .coll_subs
            .entry(collection.path().to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
