use std::collections::{BTreeMap, BTreeSet};

use crate::error::ReplicaResult;
use crate::local::overlay_resolver::OverlayCache;
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::model::{Document, DocumentKey, ResourcePath};

/// Remote base documents with their overlays applied: what the application
/// should currently see.
#[derive(Clone, Copy)]
pub struct LocalDocumentsView<'a> {
    remote_documents: &'a RemoteDocumentCache,
    overlays: &'a OverlayCache,
}

impl<'a> LocalDocumentsView<'a> {
    pub fn new(remote_documents: &'a RemoteDocumentCache, overlays: &'a OverlayCache) -> Self {
        Self {
            remote_documents,
            overlays,
        }
    }

    /// `overlay(remote_base(key))`; without an overlay the base is returned
    /// unchanged.
    pub fn get_document(&self, key: &DocumentKey) -> ReplicaResult<Document> {
        let base = self.remote_documents.get(key);
        match self.overlays.get(key) {
            Some(overlay) => overlay.apply(&base),
            None => Ok(base),
        }
    }

    pub fn get_documents<'k>(
        &self,
        keys: impl IntoIterator<Item = &'k DocumentKey>,
    ) -> ReplicaResult<BTreeMap<DocumentKey, Document>> {
        keys.into_iter()
            .map(|key| Ok((key.clone(), self.get_document(key)?)))
            .collect()
    }

    /// Every key in `collection` that has either a remote base or an overlay.
    pub fn keys_in_collection(&self, collection: &ResourcePath) -> BTreeSet<DocumentKey> {
        let mut keys: BTreeSet<DocumentKey> = self
            .remote_documents
            .documents_in_collection(collection)
            .map(|document| document.key().clone())
            .collect();
        keys.extend(self.overlays.keys_in_collection(collection));
        keys
    }

    pub fn remote_documents(&self) -> &'a RemoteDocumentCache {
        self.remote_documents
    }

    pub fn overlays(&self) -> &'a OverlayCache {
        self.overlays
    }
}
