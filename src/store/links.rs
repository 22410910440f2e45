//! Link persistence: the edge table of the content graph.

use serde::{Deserialize, Serialize};
use crate::errors::Rusqlite;

use crate::errors::{ArchiveError, Result};
use crate::model::{Link, LinkType};

use super::{ArchiveStore, parse_json_column};

/// Direction of a link relative to a queried URI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkDirection {
    Outgoing,
    Incoming,
    Both,
}

/// A stored link annotated with its direction relative to the query URI.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectedLink {
    #[serde(flatten)]
    pub link: Link,
    /// `outgoing` when the query URI is the source, `incoming` otherwise.
    pub direction: LinkDirection,
}

const LINK_COLUMNS: &str = "id, source_uri, target_uri, link_type, link_strength, \
     source_span, target_span, label, created_by, metadata, created_at";

impl ArchiveStore {
    /// Inserts a link. Strength outside `[0, 1]` is a caller error.
    pub async fn insert_link(&self, link: &Link) -> Result<()> {
        if !(0.0..=1.0).contains(&link.link_strength) {
            return Err(ArchiveError::invalid(format!(
                "link strength {} outside [0, 1]",
                link.link_strength
            )));
        }
        let l = link.clone();
        self.connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO links
                         (id, source_uri, target_uri, link_type, link_strength,
                          source_span, target_span, label, created_by, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    (
                        &l.id,
                        &l.source_uri,
                        &l.target_uri,
                        l.link_type.as_str(),
                        l.link_strength,
                        &l.source_span,
                        &l.target_span,
                        &l.label,
                        &l.created_by,
                        l.metadata.to_string(),
                        l.created_at,
                    ),
                )
                .map_err(Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(ArchiveError::from)
    }

    /// Links touching `uri` in the requested direction, newest first,
    /// optionally filtered by type.
    pub async fn find_links(
        &self,
        uri: &str,
        direction: LinkDirection,
        link_type: Option<LinkType>,
        limit: usize,
    ) -> Result<Vec<DirectedLink>> {
        let uri = uri.to_string();
        let link_type = link_type.map(|t| t.as_str().to_string());
        let direction_sql = match direction {
            LinkDirection::Outgoing => "source_uri = ?1",
            LinkDirection::Incoming => "target_uri = ?1",
            LinkDirection::Both => "(source_uri = ?1 OR target_uri = ?1)",
        };
        let sql = format!(
            "SELECT {LINK_COLUMNS} FROM links
             WHERE {direction_sql} AND (?2 IS NULL OR link_type = ?2)
             ORDER BY created_at DESC, id
             LIMIT ?3"
        );
        self.connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql).map_err(Rusqlite)?;
                let rows = stmt
                    .query_map((&uri, link_type, limit as i64), |row| {
                        let source_uri: String = row.get(1)?;
                        let link = Link {
                            id: row.get(0)?,
                            source_uri: source_uri.clone(),
                            target_uri: row.get(2)?,
                            link_type: LinkType::parse(&row.get::<_, String>(3)?)
                                .unwrap_or(LinkType::Reference),
                            link_strength: row.get(4)?,
                            source_span: row.get(5)?,
                            target_span: row.get(6)?,
                            label: row.get(7)?,
                            created_by: row.get(8)?,
                            metadata: parse_json_column(row.get(9)?),
                            created_at: row.get(10)?,
                        };
                        let direction = if source_uri == uri {
                            LinkDirection::Outgoing
                        } else {
                            LinkDirection::Incoming
                        };
                        Ok(DirectedLink { link, direction })
                    })
                    .map_err(Rusqlite)?;
                let mut links = Vec::new();
                for row in rows {
                    links.push(row.map_err(Rusqlite)?);
                }
                Ok(links)
            })
            .await
            .map_err(ArchiveError::from)
    }

    pub async fn delete_link(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        let changed = self
            .connection()
            .call(move |conn| {
                conn.execute("DELETE FROM links WHERE id = ?1", [&id])
                    .map_err(Rusqlite)
            })
            .await
            .map_err(ArchiveError::from)?;
        Ok(changed > 0)
    }
}
