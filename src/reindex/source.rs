//! Canonical catalog reader.
//!
//! Pages `canonical_material` in key order and attaches everything the
//! projection needs. Lookups for a page run in chunks of
//! `lookup_chunk_size` ids; chunks are fetched concurrently and each chunk
//! runs its six lookups concurrently.

use std::collections::HashMap;

use anyhow::{Context, Result};
use futures_util::future::try_join_all;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use shelf_core::transform::{
    CanonicalMaterial, Classification, Concept, Contributor, Identifier, MaterialBundle,
    MaterialOverride,
};

#[derive(Clone)]
pub struct CanonicalReader {
    pool: SqlitePool,
    lookup_chunk_size: usize,
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Rows of `sql` (which ends in `IN`) for the given material ids.
async fn rows_for(pool: &SqlitePool, sql: &str, ids: &[i64]) -> Result<Vec<SqliteRow>> {
    let sql = format!("{} ({})", sql, placeholders(ids.len()));
    let mut query = sqlx::query(&sql);
    for id in ids {
        query = query.bind(*id);
    }
    query
        .fetch_all(pool)
        .await
        .with_context(|| format!("Canonical lookup failed: {}", sql))
}

fn group<T>(rows: Vec<SqliteRow>, build: impl Fn(&SqliteRow) -> T) -> HashMap<i64, Vec<T>> {
    let mut grouped: HashMap<i64, Vec<T>> = HashMap::new();
    for row in &rows {
        grouped
            .entry(row.get("material_id"))
            .or_default()
            .push(build(row));
    }
    grouped
}

/// Lookups for one chunk of ids.
#[derive(Default)]
struct Lookups {
    overrides: HashMap<i64, MaterialOverride>,
    merges: HashMap<i64, String>,
    identifiers: HashMap<i64, Vec<Identifier>>,
    contributors: HashMap<i64, Vec<Contributor>>,
    concepts: HashMap<i64, Vec<Concept>>,
    classifications: HashMap<i64, Vec<Classification>>,
}

impl Lookups {
    fn extend(&mut self, other: Lookups) {
        self.overrides.extend(other.overrides);
        self.merges.extend(other.merges);
        self.identifiers.extend(other.identifiers);
        self.contributors.extend(other.contributors);
        self.concepts.extend(other.concepts);
        self.classifications.extend(other.classifications);
    }
}

impl CanonicalReader {
    pub fn new(pool: SqlitePool, lookup_chunk_size: usize) -> Self {
        Self {
            pool,
            lookup_chunk_size: lookup_chunk_size.max(1),
        }
    }

    pub async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM canonical_material")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count canonical materials")?;
        Ok(count.max(0) as u64)
    }

    /// Materials with a key greater than `after`, in key order.
    pub async fn page(&self, after: Option<i64>, limit: usize) -> Result<Vec<CanonicalMaterial>> {
        let rows = sqlx::query(
            "SELECT material_id, material_key, title, subtitle, language, issued, publisher, \
             description, material_type FROM canonical_material \
             WHERE material_id > ? ORDER BY material_id LIMIT ?",
        )
        .bind(after.unwrap_or(i64::MIN))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to read canonical page")?;

        Ok(rows
            .iter()
            .map(|row| CanonicalMaterial {
                material_id: row.get("material_id"),
                material_key: row.get("material_key"),
                title: row.get("title"),
                subtitle: row.get("subtitle"),
                language: row.get("language"),
                issued: row.get("issued"),
                publisher: row.get("publisher"),
                description: row.get("description"),
                material_type: row.get("material_type"),
            })
            .collect())
    }

    async fn lookup_chunk(&self, ids: &[i64]) -> Result<Lookups> {
        let pool = &self.pool;
        let (overrides, merges, identifiers, contributors, concepts, classifications) = tokio::try_join!(
            rows_for(
                pool,
                "SELECT material_id, title, subtitle, language, issued, publisher, description \
                 FROM material_override WHERE material_id IN",
                ids,
            ),
            rows_for(
                pool,
                "SELECT from_material_id AS material_id, to_material_key FROM material_merge \
                 WHERE from_material_id IN",
                ids,
            ),
            rows_for(
                pool,
                "SELECT material_id, scheme, value FROM material_identifier WHERE material_id IN",
                ids,
            ),
            rows_for(
                pool,
                "SELECT material_id, name, role, seq FROM material_contributor WHERE material_id IN",
                ids,
            ),
            rows_for(
                pool,
                "SELECT mc.material_id AS material_id, c.concept_id AS concept_id, c.label AS label \
                 FROM material_concept mc JOIN concept c ON c.concept_id = mc.concept_id \
                 WHERE mc.material_id IN",
                ids,
            ),
            rows_for(
                pool,
                "SELECT material_id, scheme, code FROM material_classification WHERE material_id IN",
                ids,
            ),
        )?;

        Ok(Lookups {
            overrides: overrides
                .iter()
                .map(|row| {
                    (
                        row.get("material_id"),
                        MaterialOverride {
                            title: row.get("title"),
                            subtitle: row.get("subtitle"),
                            language: row.get("language"),
                            issued: row.get("issued"),
                            publisher: row.get("publisher"),
                            description: row.get("description"),
                        },
                    )
                })
                .collect(),
            merges: merges
                .iter()
                .map(|row| (row.get("material_id"), row.get("to_material_key")))
                .collect(),
            identifiers: group(identifiers, |row| Identifier {
                scheme: row.get("scheme"),
                value: row.get("value"),
            }),
            contributors: group(contributors, |row| Contributor {
                name: row.get("name"),
                role: row.get("role"),
                seq: row.get("seq"),
            }),
            concepts: group(concepts, |row| Concept {
                concept_id: row.get("concept_id"),
                label: row.get("label"),
            }),
            classifications: group(classifications, |row| Classification {
                scheme: row.get("scheme"),
                code: row.get("code"),
            }),
        })
    }

    /// Attach overrides, merges, identifiers, contributors, concepts and
    /// classifications to a page, preserving page order.
    pub async fn bundles(&self, materials: Vec<CanonicalMaterial>) -> Result<Vec<MaterialBundle>> {
        let ids: Vec<i64> = materials.iter().map(|m| m.material_id).collect();
        let chunks = try_join_all(
            ids.chunks(self.lookup_chunk_size)
                .map(|chunk| self.lookup_chunk(chunk)),
        )
        .await?;
        let mut lookups = Lookups::default();
        for chunk in chunks {
            lookups.extend(chunk);
        }

        Ok(materials
            .into_iter()
            .map(|material| {
                let id = material.material_id;
                MaterialBundle {
                    override_fields: lookups.overrides.remove(&id),
                    merged_into: lookups.merges.remove(&id),
                    identifiers: lookups.identifiers.remove(&id).unwrap_or_default(),
                    contributors: lookups.contributors.remove(&id).unwrap_or_default(),
                    concepts: lookups.concepts.remove(&id).unwrap_or_default(),
                    classifications: lookups.classifications.remove(&id).unwrap_or_default(),
                    material,
                }
            })
            .collect())
    }

    /// One page with its lookups.
    pub async fn load_page(&self, after: Option<i64>, limit: usize) -> Result<Vec<MaterialBundle>> {
        let page = self.page(after, limit).await?;
        if page.is_empty() {
            return Ok(Vec::new());
        }
        self.bundles(page).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_schema;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        apply_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_pages_follow_key_order_and_attach_lookups() {
        let pool = pool().await;
        for (id, key, title) in [(3, "m-3", "객주"), (1, "m-1", "토지"), (2, "m-2", "Dune")] {
            sqlx::query("INSERT INTO canonical_material (material_id, material_key, title) VALUES (?, ?, ?)")
                .bind(id)
                .bind(key)
                .bind(title)
                .execute(&pool)
                .await
                .unwrap();
        }
        sqlx::query("INSERT INTO material_identifier VALUES (1, 'isbn', '978-89-546-1234-5')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO material_contributor VALUES (1, '박경리', 'author', 0)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO concept VALUES ('c1', '대하소설')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO material_concept VALUES (1, 'c1')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO material_merge VALUES (3, 'm-1')")
            .execute(&pool)
            .await
            .unwrap();

        let reader = CanonicalReader::new(pool, 1);
        assert_eq!(reader.count().await.unwrap(), 3);

        let first = reader.load_page(None, 2).await.unwrap();
        let keys: Vec<&str> = first.iter().map(|b| b.material.material_key.as_str()).collect();
        assert_eq!(keys, vec!["m-1", "m-2"]);
        assert_eq!(first[0].identifiers.len(), 1);
        assert_eq!(first[0].contributors[0].name, "박경리");
        assert_eq!(first[0].concepts[0].label, "대하소설");
        assert!(first[1].identifiers.is_empty());

        let second = reader.load_page(Some(2), 2).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].merged_into.as_deref(), Some("m-1"));
        assert!(reader.load_page(Some(3), 2).await.unwrap().is_empty());
    }
}
