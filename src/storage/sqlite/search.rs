//! Search execution and direct path retrieval.

use anyhow::{Context, Result};
use rusqlite::OptionalExtension;
use std::path::Path;

use super::{PathRecord, Store};
use crate::query::{assemble_filter, Clause, Order, Scroll, SqlParam};

/// Pagination and projection knobs for [`Store::query_tokens`].
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub order: Order,
    pub scroll: Option<Scroll>,
    pub limit: usize,
    pub include_metadata: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            order: Order::default(),
            scroll: None,
            limit: 100,
            include_metadata: false,
        }
    }
}

/// One page of search results. `next` is present when the page filled up;
/// it continues the same query after the last row.
#[derive(Debug)]
pub struct QueryPage {
    pub results: Vec<PathRecord>,
    pub next: Option<Scroll>,
}

impl Store {
    /// Execute a sanitized clause (or match everything, when `None`) with the
    /// given ordering and window.
    pub fn query_tokens(&self, clause: Option<&Clause>, options: &QueryOptions) -> Result<QueryPage> {
        let conn = self.read_conn()?;

        let mut sql = String::from("SELECT paths.pid, paths.path, paths.user, paths.time");
        if options.include_metadata {
            sql.push_str(", paths.metadata");
        }
        sql.push_str(" FROM paths");

        let mut conditions = Vec::new();
        let mut params: Vec<SqlParam> = Vec::new();
        if let Some(clause) = clause {
            let filter = assemble_filter(clause);
            conditions.push(filter.sql);
            params.extend(filter.params);
        }
        if let Some(scroll) = &options.scroll {
            let (predicate, scroll_params) = scroll.predicate(options.order)?;
            conditions.push(predicate);
            params.extend(scroll_params);
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(options.order.sql());
        sql.push_str(" LIMIT ?");
        params.push(SqlParam::Int(options.limit as i64));

        let mut stmt = conn.prepare(&sql).context("failed to prepare search query")?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            let metadata = if options.include_metadata {
                let blob: Vec<u8> = row.get(4)?;
                Some(
                    serde_json::from_slice(&blob)
                        .context("corrupt metadata blob in the index")?,
                )
            } else {
                None
            };
            results.push(PathRecord {
                pid: row.get(0)?,
                path: row.get(1)?,
                user: row.get(2)?,
                time: row.get(3)?,
                metadata,
            });
        }

        let next = if options.limit > 0 && results.len() == options.limit {
            results
                .last()
                .map(|last| Scroll::for_row(options.order, last.time, last.pid, &last.path))
        } else {
            None
        };
        Ok(QueryPage { results, next })
    }

    /// Direct lookup of one indexed path. `None` when the path is not in the
    /// index.
    pub fn retrieve_path(&self, path: &str, include_metadata: bool) -> Result<Option<PathRecord>> {
        let conn = self.read_conn()?;
        let record = conn
            .query_row(
                "SELECT pid, path, user, time, metadata FROM paths WHERE path = ?1",
                [path],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                    ))
                },
            )
            .optional()?;

        match record {
            None => Ok(None),
            Some((pid, path, user, time, blob)) => {
                let metadata = if include_metadata {
                    Some(serde_json::from_slice(&blob).context("corrupt metadata blob in the index")?)
                } else {
                    None
                };
                Ok(Some(PathRecord {
                    pid,
                    path,
                    user,
                    time,
                    metadata,
                }))
            }
        }
    }

    /// Whether `path` (or any of its ancestors) is a registered directory.
    pub fn is_directory_registered(&self, path: &str) -> Result<bool> {
        Ok(self.registered_ancestor(path)?.is_some())
    }

    /// The deepest registered directory containing `path`, if any.
    pub fn registered_ancestor(&self, path: &str) -> Result<Option<String>> {
        let ancestors = ancestor_paths(path);
        if ancestors.is_empty() {
            return Ok(None);
        }
        let conn = self.read_conn()?;
        let placeholders = vec!["?"; ancestors.len()].join(", ");
        let sql = format!(
            "SELECT path FROM dirs WHERE path IN ({placeholders}) \
             ORDER BY LENGTH(path) DESC LIMIT 1"
        );
        let root = conn
            .query_row(&sql, rusqlite::params_from_iter(ancestors.iter()), |row| {
                row.get(0)
            })
            .optional()?;
        Ok(root)
    }
}

/// Every ancestor of `path`, itself included, root last.
pub(crate) fn ancestor_paths(path: &str) -> Vec<String> {
    Path::new(path)
        .ancestors()
        .filter_map(|p| p.to_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestor_enumeration() {
        assert_eq!(
            ancestor_paths("/data/project/metadata.json"),
            vec!["/data/project/metadata.json", "/data/project", "/data", "/"]
        );
        assert_eq!(ancestor_paths("/"), vec!["/"]);
        assert!(ancestor_paths("").is_empty());
    }
}
