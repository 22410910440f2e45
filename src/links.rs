//! The link graph service: typed, bidirectional links between
//! URI-addressed content, with bounded subgraph traversal.
//!
//! URI conventions: `content://{source}/{kind}/{id}` for stored content and
//! `media://sha256/{hash}` for media files. Link endpoints must either
//! resolve locally (exact `uri` match first, id-suffix fallback second) or
//! be explicitly marked external in the link metadata.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::instrument;

use crate::errors::{ArchiveError, Result};
use crate::model::{Link, LinkType, new_id, now_seconds};
use crate::store::{ArchiveStore, DirectedLink, LinkDirection};

/// Hop cap for subgraph traversal.
pub const MAX_GRAPH_DEPTH: usize = 5;

/// A node of a traversed subgraph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub uri: String,
    /// Hops from the query URI.
    pub depth: usize,
    /// `true` when the URI does not resolve to local content.
    pub external: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub id: String,
    pub source_uri: String,
    pub target_uri: String,
    pub link_type: LinkType,
    pub link_strength: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subgraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

/// Request shape for creating one link.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLink {
    pub source_uri: String,
    pub target_uri: String,
    /// Parsed strictly; an unknown type is rejected.
    pub link_type: String,
    #[serde(default = "default_strength")]
    pub link_strength: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_span: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_span: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub created_by: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_strength() -> f64 {
    1.0
}

/// The link graph service handle.
#[derive(Clone)]
pub struct LinkGraph {
    store: ArchiveStore,
}

impl LinkGraph {
    pub fn new(store: ArchiveStore) -> Self {
        Self { store }
    }

    /// Validates and stores a new link.
    pub async fn create_link(&self, request: NewLink) -> Result<Link> {
        let link_type = LinkType::parse(&request.link_type)?;
        if !(0.0..=1.0).contains(&request.link_strength) {
            return Err(ArchiveError::invalid(format!(
                "link strength {} outside [0, 1]",
                request.link_strength
            )));
        }
        validate_uri_shape(&request.source_uri)?;
        validate_uri_shape(&request.target_uri)?;

        let external = request
            .metadata
            .get("external")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !external {
            for uri in [&request.source_uri, &request.target_uri] {
                if !self.store.uri_resolves(uri).await? {
                    return Err(ArchiveError::invalid(format!(
                        "uri does not resolve locally and is not marked external: {uri}"
                    )));
                }
            }
        }

        let link = Link {
            id: new_id(),
            source_uri: request.source_uri,
            target_uri: request.target_uri,
            link_type,
            link_strength: request.link_strength,
            source_span: request.source_span,
            target_span: request.target_span,
            label: request.label,
            created_by: request.created_by,
            metadata: request.metadata,
            created_at: now_seconds(),
        };
        self.store.insert_link(&link).await?;
        Ok(link)
    }

    /// Links touching a URI, annotated with direction.
    pub async fn find_links(
        &self,
        uri: &str,
        direction: LinkDirection,
        link_type: Option<LinkType>,
        limit: usize,
    ) -> Result<Vec<DirectedLink>> {
        self.store.find_links(uri, direction, link_type, limit).await
    }

    pub async fn delete_link(&self, id: &str) -> Result<bool> {
        self.store.delete_link(id).await
    }

    /// BFS subgraph around `uri`, hop-capped at [`MAX_GRAPH_DEPTH`] with
    /// deduplicated visits.
    #[instrument(skip(self), fields(uri = uri, depth = depth))]
    pub async fn graph(
        &self,
        uri: &str,
        depth: usize,
        types: Option<&[LinkType]>,
    ) -> Result<Subgraph> {
        let depth = depth.clamp(1, MAX_GRAPH_DEPTH);

        let mut nodes: Vec<GraphNode> = Vec::new();
        let mut edges: Vec<GraphEdge> = Vec::new();
        let mut visited: FxHashSet<String> = FxHashSet::default();
        let mut seen_edges: FxHashSet<String> = FxHashSet::default();
        let mut queue: VecDeque<(String, usize)> = VecDeque::from([(uri.to_string(), 0)]);

        while let Some((current, level)) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            nodes.push(GraphNode {
                external: !self.store.uri_resolves(&current).await?,
                uri: current.clone(),
                depth: level,
            });
            if level >= depth {
                continue;
            }

            for directed in self
                .store
                .find_links(&current, LinkDirection::Both, None, 200)
                .await?
            {
                let link = directed.link;
                if let Some(types) = types {
                    if !types.contains(&link.link_type) {
                        continue;
                    }
                }
                let neighbor = if link.source_uri == current {
                    link.target_uri.clone()
                } else {
                    link.source_uri.clone()
                };
                if seen_edges.insert(link.id.clone()) {
                    edges.push(GraphEdge {
                        id: link.id,
                        source_uri: link.source_uri,
                        target_uri: link.target_uri,
                        link_type: link.link_type,
                        link_strength: link.link_strength,
                    });
                }
                if !visited.contains(&neighbor) {
                    queue.push_back((neighbor, level + 1));
                }
            }
        }

        Ok(Subgraph { nodes, edges })
    }
}

/// Accepts `content://{source}/{kind}/{id}` and `media://sha256/{hash}`.
fn validate_uri_shape(uri: &str) -> Result<()> {
    if let Some(rest) = uri.strip_prefix("content://") {
        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() >= 3 {
            return Ok(());
        }
        return Err(ArchiveError::invalid(format!(
            "content uri needs source/kind/id segments: {uri}"
        )));
    }
    if let Some(rest) = uri.strip_prefix("media://") {
        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() == 2 && segments[0] == "sha256" {
            return Ok(());
        }
        return Err(ArchiveError::invalid(format!(
            "media uri must be media://sha256/<hash>: {uri}"
        )));
    }
    Err(ArchiveError::invalid(format!("unknown uri scheme: {uri}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_shapes() {
        assert!(validate_uri_shape("content://facebook/post/123").is_ok());
        assert!(validate_uri_shape("media://sha256/abcdef0123").is_ok());
        assert!(validate_uri_shape("content://too/short").is_err());
        assert!(validate_uri_shape("media://md5/abc").is_err());
        assert!(validate_uri_shape("https://example.com").is_err());
    }
}
