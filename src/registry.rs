//! The singleton handle set exposed to the surrounding application.
//!
//! An embedding application builds one [`ServiceRegistry`] at startup and
//! calls [`ServiceRegistry::activate`] whenever the active archive path
//! changes; the whole handle set is rebuilt against the new store and
//! swapped atomically, so request handlers never observe a half-switched
//! state.

use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::config::ServiceConfig;
use crate::discovery::MetadataDiscovery;
use crate::embedding::EmbeddingBackend;
use crate::errors::Result;
use crate::harvest::HarvestService;
use crate::import::ImportPipeline;
use crate::indexer::ArchiveIndexer;
use crate::links::LinkGraph;
use crate::search::HybridSearch;
use crate::store::ArchiveStore;

/// Everything the HTTP layer is allowed to touch, bound to one archive.
pub struct ServiceHandles {
    pub archive_root: PathBuf,
    pub store: ArchiveStore,
    pub indexer: Arc<ArchiveIndexer>,
    pub harvest: Arc<HarvestService>,
    pub hybrid: Arc<HybridSearch>,
    pub discovery: Arc<MetadataDiscovery>,
    pub links: Arc<LinkGraph>,
    pub imports: Arc<ImportPipeline>,
}

/// Atomically swappable registry of the active archive's handles.
#[derive(Default)]
pub struct ServiceRegistry {
    inner: RwLock<Option<Arc<ServiceHandles>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The handles for the currently active archive, if any.
    pub fn current(&self) -> Option<Arc<ServiceHandles>> {
        self.inner.read().clone()
    }

    /// Builds the full handle set against `archive_root` and swaps it in.
    /// The previous set keeps serving in-flight requests until their
    /// references drop.
    pub async fn activate(
        &self,
        archive_root: impl AsRef<Path>,
        backend: Arc<dyn EmbeddingBackend>,
        config: &ServiceConfig,
    ) -> Result<Arc<ServiceHandles>> {
        let archive_root = archive_root.as_ref().to_path_buf();
        let store =
            ArchiveStore::open_in_archive(&archive_root, config.embeddings.dimensions).await?;

        let indexer = Arc::new(ArchiveIndexer::new(
            store.clone(),
            Arc::clone(&backend),
            config,
        ));
        let harvest = Arc::new(HarvestService::new(
            store.clone(),
            Arc::clone(&backend),
            config.retrieval.hybrid.clone(),
        ));
        let hybrid = Arc::new(HybridSearch::new(
            store.clone(),
            config.retrieval.hybrid.clone(),
        ));
        let discovery = Arc::new(MetadataDiscovery::new(store.clone()));
        let links = Arc::new(LinkGraph::new(store.clone()));
        let imports = Arc::new(
            ImportPipeline::new(store.clone())
                .with_default_parsers()
                .with_indexer(Arc::clone(&indexer))
                .with_backend(backend)
                .with_discovery(Arc::clone(&discovery)),
        );

        let handles = Arc::new(ServiceHandles {
            archive_root: archive_root.clone(),
            store,
            indexer,
            harvest,
            hybrid,
            discovery,
            links,
            imports,
        });
        *self.inner.write() = Some(Arc::clone(&handles));
        info!(root = %archive_root.display(), "archive activated");
        Ok(handles)
    }

    /// Drops the active handle set (archive closed).
    pub fn deactivate(&self) {
        *self.inner.write() = None;
    }
}
