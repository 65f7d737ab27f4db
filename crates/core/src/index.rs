//! In-memory hierarchical index: documents own pages, pages own a
//! contiguous range of section nodes.
//!
//! A document's subtree is built off-lock and published in one write, so
//! searches never observe a half-ingested document. Ingestion of the same
//! document id is serialized; different documents ingest independently.
//! Dense and sparse scans run on the blocking pool so callers can bound
//! them with a timeout.

use crate::embeddings::{cosine_similarity, Embedder, HashedNgramEmbedder};
use crate::extractor::{extract_page_texts, FileKind};
use crate::ingest::{digest_bytes, document_id_for};
use crate::lexical::{self, Bm25Stats};
use crate::models::{
    Document, DocumentId, DocumentStatus, Node, NodeId, Page, PageAnchor, RawFile, ScoredNode,
};
use crate::sectioning::{Sectioner, SectioningOptions};
use crate::traits::{AnchorResolver, DenseSearch, SparseSearch};
use crate::{IngestError, SearchError};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

const SNAPSHOT_VERSION: u32 = 1;

pub struct HierarchicalIndex {
    state: Arc<RwLock<IndexState>>,
    ingest_locks: Mutex<HashMap<DocumentId, Arc<tokio::sync::Mutex<()>>>>,
    generation: AtomicU64,
    embedder: Arc<dyn Embedder>,
    sectioner: Arc<Sectioner>,
}

#[derive(Default)]
struct IndexState {
    documents: BTreeMap<DocumentId, DocumentEntry>,
    locator: HashMap<NodeId, NodeSlot>,
}

struct DocumentEntry {
    document: Document,
    nodes: Vec<Arc<Node>>,
}

impl DocumentEntry {
    fn is_searchable(&self) -> bool {
        self.document.status == DocumentStatus::Indexed
    }
}

struct NodeSlot {
    document_id: DocumentId,
    offset: usize,
}

impl HierarchicalIndex {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        options: SectioningOptions,
    ) -> Result<Self, IngestError> {
        Ok(Self {
            state: Arc::new(RwLock::new(IndexState::default())),
            ingest_locks: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            embedder,
            sectioner: Arc::new(Sectioner::new(options)?),
        })
    }

    pub fn with_defaults() -> Result<Self, IngestError> {
        Self::new(
            Arc::new(HashedNgramEmbedder::default()),
            SectioningOptions::default(),
        )
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        Arc::clone(&self.embedder)
    }

    /// Registers a placeholder so callers can see a document waiting for
    /// ingestion. Existing documents are left untouched.
    pub fn enqueue(&self, filename: &str) -> DocumentId {
        let document_id = document_id_for(filename);
        let mut state = self.write_state();
        state
            .documents
            .entry(document_id.clone())
            .or_insert_with(|| placeholder(&document_id, filename, "", DocumentStatus::Queued));
        document_id
    }

    pub async fn ingest(&self, file: RawFile) -> Result<DocumentId, IngestError> {
        FileKind::detect(&file)?;
        let document_id = document_id_for(&file.filename);

        let lock = self.ingest_lock(&document_id);
        let guard = lock.lock().await;

        let first_build = self.mark_processing(&document_id, &file);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let embedder = Arc::clone(&self.embedder);
        let sectioner = Arc::clone(&self.sectioner);
        let build_id = document_id.clone();
        let filename = file.filename.clone();

        let built = tokio::task::spawn_blocking(move || {
            build_tree(&build_id, generation, &file, &sectioner, embedder.as_ref())
        })
        .await
        .map_err(|error| IngestError::ParseFailure(format!("ingestion task failed: {error}")))
        .and_then(|result| result);

        let outcome = match built {
            Ok((document, nodes)) => {
                info!(
                    document_id = %document_id,
                    filename = %filename,
                    pages = document.pages.len(),
                    nodes = nodes.len(),
                    "document indexed"
                );
                self.publish(document, nodes);
                Ok(document_id.clone())
            }
            Err(error) => {
                warn!(document_id = %document_id, filename = %filename, %error, "ingestion failed");
                if first_build {
                    self.set_status(&document_id, DocumentStatus::Failed);
                }
                Err(error)
            }
        };

        drop(guard);
        self.release_ingest_lock(&document_id, lock);
        outcome
    }

    pub fn documents(&self) -> Vec<Document> {
        self.read_state()
            .documents
            .values()
            .map(|entry| entry.document.clone())
            .collect()
    }

    pub fn document(&self, document_id: &str) -> Option<Document> {
        self.read_state()
            .documents
            .get(document_id)
            .map(|entry| entry.document.clone())
    }

    /// Drops a document and, with it, every node it owns. Waits for an
    /// in-flight ingest of the same id so its publish cannot revive it.
    pub async fn remove(&self, document_id: &str) -> bool {
        let lock = self.ingest_lock(document_id);
        let guard = lock.lock().await;

        let removed = {
            let mut state = self.write_state();
            match state.documents.remove(document_id) {
                Some(entry) => {
                    for node in &entry.nodes {
                        state.locator.remove(&node.node_id);
                    }
                    info!(document_id, nodes = entry.nodes.len(), "document removed");
                    true
                }
                None => false,
            }
        };

        drop(guard);
        self.release_ingest_lock(document_id, lock);
        removed
    }

    /// Marks a document that never got a tree as failed. Published
    /// documents keep serving their last good tree.
    pub(crate) fn mark_failed(&self, document_id: &str) {
        if let Some(entry) = self.write_state().documents.get_mut(document_id) {
            if !entry.is_searchable() {
                entry.document.status = DocumentStatus::Failed;
            }
        }
    }

    pub fn node(&self, node_id: &str) -> Option<Arc<Node>> {
        let state = self.read_state();
        let slot = state.locator.get(node_id)?;
        let entry = state.documents.get(&slot.document_id)?;
        entry.nodes.get(slot.offset).cloned()
    }

    /// Sibling nodes sharing a page, found through the page's node range.
    pub fn page_nodes(&self, document_id: &str, page_number: u32) -> Vec<Arc<Node>> {
        let state = self.read_state();
        let Some(entry) = state.documents.get(document_id) else {
            return Vec::new();
        };
        match entry.document.page(page_number) {
            Some(page) => entry
                .nodes
                .get(page.nodes.clone())
                .map(<[Arc<Node>]>::to_vec)
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    pub fn searchable_node_count(&self) -> usize {
        self.read_state()
            .documents
            .values()
            .filter(|entry| entry.is_searchable())
            .map(|entry| entry.nodes.len())
            .sum()
    }

    pub fn nearest(&self, query_embedding: &[f32], k: usize) -> Vec<ScoredNode> {
        nearest_in(&self.read_state(), query_embedding, k)
    }

    /// BM25 over section title and body terms.
    pub fn lexical(&self, query_terms: &[String], k: usize) -> Vec<ScoredNode> {
        lexical_in(&self.read_state(), query_terms, k)
    }

    pub fn save(&self, path: &Path) -> Result<(), IngestError> {
        let snapshot = {
            let state = self.read_state();
            IndexSnapshot {
                version: SNAPSHOT_VERSION,
                generation: self.generation.load(Ordering::SeqCst),
                embedding_dimensions: self.embedder.dimensions(),
                documents: state
                    .documents
                    .values()
                    .filter(|entry| {
                        matches!(
                            entry.document.status,
                            DocumentStatus::Indexed | DocumentStatus::Failed
                        )
                    })
                    .map(|entry| DocumentSnapshot {
                        document: entry.document.clone(),
                        nodes: entry.nodes.iter().map(|node| node.as_ref().clone()).collect(),
                    })
                    .collect(),
            }
        };

        let encoded = serde_json::to_vec(&snapshot)?;
        let staging = path.with_extension("tmp");
        std::fs::write(&staging, encoded)?;
        std::fs::rename(&staging, path)?;
        debug!(path = %path.display(), documents = snapshot.documents.len(), "index saved");
        Ok(())
    }

    pub fn load(
        path: &Path,
        embedder: Arc<dyn Embedder>,
        options: SectioningOptions,
    ) -> Result<Self, IngestError> {
        let bytes = std::fs::read(path)?;
        let snapshot: IndexSnapshot = serde_json::from_slice(&bytes)?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(IngestError::InvalidArgument(format!(
                "unsupported index snapshot version {}",
                snapshot.version
            )));
        }
        if snapshot.embedding_dimensions != embedder.dimensions() {
            return Err(IngestError::InvalidArgument(format!(
                "snapshot uses {}-dimensional embeddings, embedder produces {}",
                snapshot.embedding_dimensions,
                embedder.dimensions()
            )));
        }

        let index = Self::new(embedder, options)?;
        index.generation.store(snapshot.generation, Ordering::SeqCst);
        {
            let mut state = index.write_state();
            for entry in snapshot.documents {
                validate_snapshot_entry(&entry)?;
                let nodes: Vec<Arc<Node>> = entry.nodes.into_iter().map(Arc::new).collect();
                insert_entry(&mut state, entry.document, nodes);
            }
        }
        info!(path = %path.display(), documents = index.documents().len(), "index loaded");
        Ok(index)
    }

    fn ingest_lock(&self, document_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .ingest_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(document_id.to_string()).or_default())
    }

    /// Drops the map's entry once no other task holds or waits on it.
    /// Clones only happen under the map mutex, so a count of two (map plus
    /// `lock`) cannot grow while it is held.
    fn release_ingest_lock(&self, document_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self
            .ingest_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let idle = locks
            .get(document_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, &lock) && Arc::strong_count(&lock) == 2);
        if idle {
            locks.remove(document_id);
        }
    }

    /// Returns true when the document has no published tree yet.
    fn mark_processing(&self, document_id: &str, file: &RawFile) -> bool {
        let mut state = self.write_state();
        match state.documents.get_mut(document_id) {
            Some(entry) if entry.is_searchable() => false,
            Some(entry) => {
                entry.document.status = DocumentStatus::Processing;
                entry.document.checksum = digest_bytes(&file.bytes);
                true
            }
            None => {
                state.documents.insert(
                    document_id.to_string(),
                    placeholder(
                        document_id,
                        &file.filename,
                        &digest_bytes(&file.bytes),
                        DocumentStatus::Processing,
                    ),
                );
                true
            }
        }
    }

    fn set_status(&self, document_id: &str, status: DocumentStatus) {
        if let Some(entry) = self.write_state().documents.get_mut(document_id) {
            entry.document.status = status;
        }
    }

    fn publish(&self, document: Document, nodes: Vec<Arc<Node>>) {
        let mut state = self.write_state();
        insert_entry(&mut state, document, nodes);
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AnchorResolver for HierarchicalIndex {
    fn resolve(&self, node_id: &str) -> Option<PageAnchor> {
        let state = self.read_state();
        let slot = state.locator.get(node_id)?;
        let entry = state.documents.get(&slot.document_id)?;
        if !entry.is_searchable() {
            return None;
        }
        let node = entry.nodes.get(slot.offset)?;
        let page = entry
            .document
            .pages
            .iter()
            .find(|page| page.nodes.contains(&slot.offset))?;
        (node.node_id == node_id && page.number == node.page_number).then(|| PageAnchor {
            document_id: entry.document.id.clone(),
            filename: entry.document.filename.clone(),
            page_number: page.number,
        })
    }
}

#[async_trait]
impl DenseSearch for HierarchicalIndex {
    async fn search_dense(
        &self,
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredNode>, SearchError> {
        if query_embedding.len() != self.embedder.dimensions() {
            return Err(SearchError::Request(format!(
                "query embedding has {} dimensions, index expects {}",
                query_embedding.len(),
                self.embedder.dimensions()
            )));
        }
        let state = Arc::clone(&self.state);
        let query_embedding = query_embedding.to_vec();
        tokio::task::spawn_blocking(move || {
            let state = state.read().unwrap_or_else(PoisonError::into_inner);
            nearest_in(&state, &query_embedding, k)
        })
        .await
        .map_err(|error| SearchError::Request(format!("dense search task failed: {error}")))
    }
}

#[async_trait]
impl SparseSearch for HierarchicalIndex {
    async fn search_sparse(
        &self,
        query_terms: &[String],
        k: usize,
    ) -> Result<Vec<ScoredNode>, SearchError> {
        let state = Arc::clone(&self.state);
        let query_terms = query_terms.to_vec();
        tokio::task::spawn_blocking(move || {
            let state = state.read().unwrap_or_else(PoisonError::into_inner);
            lexical_in(&state, &query_terms, k)
        })
        .await
        .map_err(|error| SearchError::Request(format!("sparse search task failed: {error}")))
    }
}

#[derive(Serialize, Deserialize)]
struct IndexSnapshot {
    version: u32,
    generation: u64,
    embedding_dimensions: usize,
    documents: Vec<DocumentSnapshot>,
}

#[derive(Serialize, Deserialize)]
struct DocumentSnapshot {
    document: Document,
    nodes: Vec<Node>,
}

fn validate_snapshot_entry(entry: &DocumentSnapshot) -> Result<(), IngestError> {
    let id = &entry.document.id;
    if entry.nodes.iter().any(|node| &node.document_id != id) {
        return Err(IngestError::InvalidArgument(format!(
            "snapshot document {id} holds nodes of another document"
        )));
    }
    if entry
        .document
        .pages
        .iter()
        .any(|page| page.nodes.end > entry.nodes.len() || page.nodes.start > page.nodes.end)
    {
        return Err(IngestError::InvalidArgument(format!(
            "snapshot document {id} has a page range outside its nodes"
        )));
    }
    Ok(())
}

fn insert_entry(state: &mut IndexState, document: Document, nodes: Vec<Arc<Node>>) {
    if let Some(previous) = state.documents.remove(&document.id) {
        for node in &previous.nodes {
            state.locator.remove(&node.node_id);
        }
    }
    for (offset, node) in nodes.iter().enumerate() {
        state.locator.insert(
            node.node_id.clone(),
            NodeSlot {
                document_id: document.id.clone(),
                offset,
            },
        );
    }
    state
        .documents
        .insert(document.id.clone(), DocumentEntry { document, nodes });
}

fn placeholder(
    document_id: &str,
    filename: &str,
    checksum: &str,
    status: DocumentStatus,
) -> DocumentEntry {
    DocumentEntry {
        document: Document {
            id: document_id.to_string(),
            filename: filename.to_string(),
            checksum: checksum.to_string(),
            pages: Vec::new(),
            ingested_at: Utc::now(),
            status,
        },
        nodes: Vec::new(),
    }
}

fn searchable_nodes(state: &IndexState) -> impl Iterator<Item = &Arc<Node>> {
    state
        .documents
        .values()
        .filter(|entry| entry.is_searchable())
        .flat_map(|entry| entry.nodes.iter())
}

fn nearest_in(state: &IndexState, query_embedding: &[f32], k: usize) -> Vec<ScoredNode> {
    let scored = searchable_nodes(state)
        .map(|node| ScoredNode {
            score: cosine_similarity(query_embedding, &node.embedding),
            node: Arc::clone(node),
        })
        .collect();
    top_k(scored, k)
}

fn lexical_in(state: &IndexState, query_terms: &[String], k: usize) -> Vec<ScoredNode> {
    let unique_terms: BTreeSet<&str> = query_terms.iter().map(String::as_str).collect();
    if unique_terms.is_empty() {
        return Vec::new();
    }

    let nodes: Vec<&Arc<Node>> = searchable_nodes(state).collect();
    if nodes.is_empty() {
        return Vec::new();
    }

    let total_terms: u64 = nodes.iter().map(|node| u64::from(node.term_count)).sum();
    let stats = Bm25Stats {
        document_count: nodes.len(),
        average_length: total_terms as f64 / nodes.len() as f64,
    };

    let weights: Vec<(&str, f64)> = unique_terms
        .iter()
        .map(|term| {
            let frequency = nodes
                .iter()
                .filter(|node| node.term_frequencies.contains_key(*term))
                .count();
            (*term, lexical::idf(stats, frequency))
        })
        .collect();

    let scored = nodes
        .into_iter()
        .filter_map(|node| {
            let score: f64 = weights
                .iter()
                .map(|(term, idf)| {
                    let frequency = node.term_frequencies.get(*term).copied().unwrap_or(0);
                    lexical::bm25_term(stats, *idf, frequency, node.term_count)
                })
                .sum();
            (score > 0.0).then(|| ScoredNode {
                node: Arc::clone(node),
                score,
            })
        })
        .collect();

    top_k(scored, k)
}

fn top_k(mut scored: Vec<ScoredNode>, k: usize) -> Vec<ScoredNode> {
    scored.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| left.node.node_id.cmp(&right.node.node_id))
    });
    scored.truncate(k);
    scored
}

fn build_tree(
    document_id: &str,
    generation: u64,
    file: &RawFile,
    sectioner: &Sectioner,
    embedder: &dyn Embedder,
) -> Result<(Document, Vec<Arc<Node>>), IngestError> {
    let pages = extract_page_texts(file)?;
    let mut nodes = Vec::new();
    let mut page_entries = Vec::new();

    for page in pages {
        let start = nodes.len();
        for section in sectioner.split_page(page.number, &page.text) {
            let indexed_text = format!("{} {}", section.title, section.text);
            let terms = lexical::tokenize(&indexed_text);
            nodes.push(Arc::new(Node {
                node_id: make_node_id(document_id, generation, page.number, section.index),
                document_id: document_id.to_string(),
                filename: file.filename.clone(),
                page_number: page.number,
                section_index: section.index,
                title: section.title,
                embedding: embedder.embed(&indexed_text),
                term_frequencies: lexical::term_frequencies(&terms),
                term_count: terms.len() as u32,
                text: section.text,
            }));
        }
        if nodes.len() > start {
            page_entries.push(Page {
                number: page.number,
                nodes: start..nodes.len(),
            });
        }
    }

    if nodes.is_empty() {
        return Err(IngestError::ParseFailure(format!(
            "no sections could be extracted from {}",
            file.filename
        )));
    }

    let document = Document {
        id: document_id.to_string(),
        filename: file.filename.clone(),
        checksum: digest_bytes(&file.bytes),
        pages: page_entries,
        ingested_at: Utc::now(),
        status: DocumentStatus::Indexed,
    };

    Ok((document, nodes))
}

fn make_node_id(document_id: &str, generation: u64, page: u32, section: u32) -> NodeId {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(generation.to_le_bytes());
    hasher.update(page.to_le_bytes());
    hasher.update(section.to_le_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..24].to_string()
}
