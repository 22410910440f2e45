//! The search capability seam.
//!
//! Embedding search is one capability with per-granularity variants; the
//! HTTP layer holds these instead of knowing the table layout. Each
//! variant pairs a filter shape with a hit shape and delegates to the
//! store's pre-filtered dense search.

use async_trait::async_trait;

use crate::errors::Result;
use crate::model::{BlockKind, ContentKind, Role};

use super::{ArchiveStore, BlockHit, ChunkHit, ImageHit, ItemHit, MessageHit};

/// Dense search at one granularity, pre-filtered by `Filter`.
#[async_trait]
pub trait SearchableIndex: Send + Sync {
    type Filter: Send + Default;
    type Hit: Send;

    async fn search(
        &self,
        query: &[f32],
        limit: usize,
        filter: Self::Filter,
    ) -> Result<Vec<Self::Hit>>;
}

/// Message-grain search, filterable by author role.
#[derive(Clone)]
pub struct MessageIndex(pub ArchiveStore);

#[async_trait]
impl SearchableIndex for MessageIndex {
    type Filter = Option<Role>;
    type Hit = MessageHit;

    async fn search(
        &self,
        query: &[f32],
        limit: usize,
        filter: Self::Filter,
    ) -> Result<Vec<MessageHit>> {
        self.0.search_messages(query, limit, filter).await
    }
}

/// Chunk-grain search, filterable by content types.
#[derive(Clone)]
pub struct ChunkIndex(pub ArchiveStore);

#[async_trait]
impl SearchableIndex for ChunkIndex {
    type Filter = Option<Vec<ContentKind>>;
    type Hit = ChunkHit;

    async fn search(
        &self,
        query: &[f32],
        limit: usize,
        filter: Self::Filter,
    ) -> Result<Vec<ChunkHit>> {
        self.0.search_chunks(query, limit, filter.as_deref()).await
    }
}

/// Filter for the content-item grain.
#[derive(Clone, Debug, Default)]
pub struct ItemFilter {
    pub item_type: Option<String>,
    pub source: Option<String>,
}

#[derive(Clone)]
pub struct ContentItemIndex(pub ArchiveStore);

#[async_trait]
impl SearchableIndex for ContentItemIndex {
    type Filter = ItemFilter;
    type Hit = ItemHit;

    async fn search(
        &self,
        query: &[f32],
        limit: usize,
        filter: Self::Filter,
    ) -> Result<Vec<ItemHit>> {
        self.0
            .search_content_items(
                query,
                limit,
                filter.item_type.as_deref(),
                filter.source.as_deref(),
            )
            .await
    }
}

/// Filter for the content-block grain.
#[derive(Clone, Debug, Default)]
pub struct BlockFilter {
    pub block_type: Option<BlockKind>,
    pub gizmo_id: Option<String>,
}

#[derive(Clone)]
pub struct ContentBlockIndex(pub ArchiveStore);

#[async_trait]
impl SearchableIndex for ContentBlockIndex {
    type Filter = BlockFilter;
    type Hit = BlockHit;

    async fn search(
        &self,
        query: &[f32],
        limit: usize,
        filter: Self::Filter,
    ) -> Result<Vec<BlockHit>> {
        self.0
            .search_content_blocks(query, limit, filter.block_type, filter.gizmo_id.as_deref())
            .await
    }
}

/// Image-description search; no pre-filter beyond the grain itself.
#[derive(Clone)]
pub struct ImageIndex(pub ArchiveStore);

#[async_trait]
impl SearchableIndex for ImageIndex {
    type Filter = ();
    type Hit = ImageHit;

    async fn search(&self, query: &[f32], limit: usize, _filter: ()) -> Result<Vec<ImageHit>> {
        self.0.search_images_by_description_vector(query, limit).await
    }
}
