use std::collections::{BTreeMap, BTreeSet};

use crate::core::query::{LimitType, Query};
use crate::error::ReplicaResult;
use crate::local::index_manager::IndexManager;
use crate::local::local_documents::LocalDocumentsView;
use crate::model::{Document, DocumentKey, SnapshotVersion};

/// How a query result was produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStrategy {
    /// Candidates came from a client-side field index.
    Indexed,
    /// The target's previous remote keys plus documents changed since its
    /// last limbo-free snapshot.
    CachedResults,
    /// Every document in the collection.
    FullScan,
}

#[derive(Clone, Debug)]
pub struct QueryResult {
    /// Local documents matching the query, before any limit is applied.
    pub documents: BTreeMap<DocumentKey, Document>,
    /// Keys the server last reported for the query's target.
    pub remote_keys: BTreeSet<DocumentKey>,
    pub strategy: QueryStrategy,
}

/// What the target cache remembers about a previously listened query.
#[derive(Clone, Debug, Default)]
pub struct PreviousResults {
    pub remote_keys: BTreeSet<DocumentKey>,
    pub last_limbo_free_snapshot_version: SnapshotVersion,
}

/// Runs `query` against the local document view.
///
/// Index lookups win when an index serves one of the query's equality
/// filters. Otherwise the previous results of the target are reused unless
/// they are stale, and a full scan is the fallback. Every strategy re-checks
/// each candidate against the query, so results never violate its filters.
pub fn execute_query(
    query: &Query,
    documents: LocalDocumentsView<'_>,
    indexes: &IndexManager,
    previous: Option<&PreviousResults>,
) -> ReplicaResult<QueryResult> {
    let remote_keys = previous
        .map(|previous| previous.remote_keys.clone())
        .unwrap_or_default();

    if let Some(candidates) = indexes.candidate_keys(query) {
        let mut keys = candidates;
        keys.extend(documents.overlays().keys_in_collection(query.path()));
        let matched = matching_documents(query, documents, &keys)?;
        return Ok(QueryResult {
            documents: matched,
            remote_keys,
            strategy: QueryStrategy::Indexed,
        });
    }

    if let Some(previous) = previous {
        if let Some(matched) = from_previous_results(query, documents, previous)? {
            return Ok(QueryResult {
                documents: matched,
                remote_keys,
                strategy: QueryStrategy::CachedResults,
            });
        }
    }

    let keys = if query.is_document_query() {
        DocumentKey::from_path(query.path().clone())
            .map(|key| BTreeSet::from([key]))
            .unwrap_or_default()
    } else {
        documents.keys_in_collection(query.path())
    };
    Ok(QueryResult {
        documents: matching_documents(query, documents, &keys)?,
        remote_keys,
        strategy: QueryStrategy::FullScan,
    })
}

fn matching_documents(
    query: &Query,
    documents: LocalDocumentsView<'_>,
    keys: &BTreeSet<DocumentKey>,
) -> ReplicaResult<BTreeMap<DocumentKey, Document>> {
    let mut matched = BTreeMap::new();
    for (key, document) in documents.get_documents(keys)? {
        if query.matches(&document) {
            matched.insert(key, document);
        }
    }
    Ok(matched)
}

fn from_previous_results(
    query: &Query,
    documents: LocalDocumentsView<'_>,
    previous: &PreviousResults,
) -> ReplicaResult<Option<BTreeMap<DocumentKey, Document>>> {
    let version = previous.last_limbo_free_snapshot_version;
    if version.is_min() || query.is_document_query() {
        return Ok(None);
    }

    let previous_matches = matching_documents(query, documents, &previous.remote_keys)?;
    if needs_refill(query, &previous_matches, previous) {
        return Ok(None);
    }

    let mut keys: BTreeSet<DocumentKey> = previous_matches.keys().cloned().collect();
    keys.extend(
        documents
            .remote_documents()
            .documents_changed_since(query.path(), version)
            .map(|document| document.key().clone()),
    );
    keys.extend(documents.overlays().keys_in_collection(query.path()));
    Ok(Some(matching_documents(query, documents, &keys)?))
}

/// A limited query whose previous results no longer all match, or whose
/// edge document may have moved, cannot be trusted to still hold the right
/// top-N and needs a full scan.
fn needs_refill(
    query: &Query,
    previous_matches: &BTreeMap<DocumentKey, Document>,
    previous: &PreviousResults,
) -> bool {
    if !query.has_limit() {
        return false;
    }
    if previous_matches.len() != previous.remote_keys.len() {
        return true;
    }
    let comparator = query.comparator();
    let mut sorted: Vec<&Document> = previous_matches.values().collect();
    sorted.sort_by(|left, right| comparator(*left, *right));
    let edge = match query.limit_type() {
        LimitType::First => sorted.last(),
        LimitType::Last => sorted.first(),
    };
    match edge {
        Some(edge) => {
            edge.has_unconfirmed_writes() || edge.version() > previous.last_limbo_free_snapshot_version
        }
        None => false,
    }
}
