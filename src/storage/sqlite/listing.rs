//! Listings of registered directories, fields, and tokens.

use anyhow::{Context, Result};
use serde::Serialize;

use super::search::ancestor_paths;
use super::{DirectoryRecord, Store};
use crate::query::SqlParam;

/// Filters for [`Store::list_registered_directories`].
#[derive(Debug, Clone, Default)]
pub struct RegisteredFilter {
    /// Only directories registered by this user.
    pub user: Option<String>,
    /// Only directories containing this path (ancestor enumeration).
    pub contains_path: Option<String>,
    /// Only directories at or under this path.
    pub within_path: Option<String>,
    /// Only directories whose registered path starts with this string.
    pub path_prefix: Option<String>,
    /// Keep directories that do (`true`) or do not (`false`) still exist on
    /// disk.
    pub exists: Option<bool>,
    pub scroll: Option<i64>,
    pub limit: usize,
}

/// One page of registered directories; `next` scrolls by `did`.
#[derive(Debug)]
pub struct DirectoryPage {
    pub results: Vec<DirectoryRecord>,
    pub next: Option<i64>,
}

/// A field or token with an optional per-path count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamedCount {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
}

impl Store {
    pub fn list_registered_directories(&self, filter: &RegisteredFilter) -> Result<DirectoryPage> {
        let conn = self.read_conn()?;

        let mut conditions = Vec::new();
        let mut params: Vec<SqlParam> = Vec::new();
        if let Some(user) = &filter.user {
            conditions.push("user = ?".to_string());
            params.push(SqlParam::Text(user.clone()));
        }
        if let Some(contains) = &filter.contains_path {
            let ancestors = ancestor_paths(contains);
            let placeholders = vec!["?"; ancestors.len().max(1)].join(", ");
            conditions.push(format!("path IN ({placeholders})"));
            if ancestors.is_empty() {
                params.push(SqlParam::Text(String::new()));
            }
            params.extend(ancestors.into_iter().map(SqlParam::Text));
        }
        if let Some(within) = &filter.within_path {
            conditions.push("(path = ? OR path GLOB ?)".to_string());
            params.push(SqlParam::Text(within.clone()));
            params.push(SqlParam::Text(format!("{}/*", escape_glob(within))));
        }
        if let Some(prefix) = &filter.path_prefix {
            conditions.push("path GLOB ?".to_string());
            params.push(SqlParam::Text(format!("{}*", escape_glob(prefix))));
        }
        if let Some(scroll) = filter.scroll {
            conditions.push("did > ?".to_string());
            params.push(SqlParam::Int(scroll));
        }

        let mut sql = String::from("SELECT did, path, user, time, names FROM dirs");
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY did LIMIT ?");
        params.push(SqlParam::Int(filter.limit as i64));

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
        let mut fetched = Vec::new();
        while let Some(row) = rows.next()? {
            let names_blob: Vec<u8> = row.get(4)?;
            fetched.push(DirectoryRecord {
                did: row.get(0)?,
                path: row.get(1)?,
                user: row.get(2)?,
                time: row.get(3)?,
                names: serde_json::from_slice(&names_blob)
                    .context("corrupt base names in the index")?,
            });
        }

        // The scroll window is computed before the existence filter so a
        // partially-filtered page still advances.
        let next = if filter.limit > 0 && fetched.len() == filter.limit {
            fetched.last().map(|last| last.did)
        } else {
            None
        };

        let results = match filter.exists {
            None => fetched,
            Some(want) => fetched
                .into_iter()
                .filter(|dir| {
                    let present = std::fs::metadata(&dir.path)
                        .map(|meta| meta.is_dir())
                        .unwrap_or(false);
                    present == want
                })
                .collect(),
        };

        Ok(DirectoryPage { results, next })
    }

    /// List interned fields in ASCII order, optionally filtered by a glob
    /// pattern, optionally with the number of distinct paths using each.
    pub fn list_fields(
        &self,
        pattern: Option<&str>,
        count: bool,
        scroll: Option<&str>,
        limit: usize,
    ) -> Result<(Vec<NamedCount>, Option<String>)> {
        let conn = self.read_conn()?;

        let mut conditions = Vec::new();
        let mut params: Vec<SqlParam> = Vec::new();
        if let Some(pattern) = pattern {
            conditions.push("fields.field GLOB ?".to_string());
            params.push(SqlParam::Text(pattern.to_string()));
        }
        if let Some(scroll) = scroll {
            conditions.push("fields.field > ?".to_string());
            params.push(SqlParam::Text(scroll.to_string()));
        }
        let where_sql = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let sql = if count {
            format!(
                "SELECT fields.field, COUNT(DISTINCT links.pid) FROM fields \
                 LEFT JOIN links ON links.fid = fields.fid{where_sql} \
                 GROUP BY fields.fid ORDER BY fields.field LIMIT ?"
            )
        } else {
            format!("SELECT fields.field FROM fields{where_sql} ORDER BY fields.field LIMIT ?")
        };
        params.push(SqlParam::Int(limit as i64));

        collect_named(&conn, &sql, params, count, limit)
    }

    /// List interned tokens in ASCII order, optionally filtered by a glob
    /// pattern and/or restricted to tokens appearing under `field`.
    pub fn list_tokens(
        &self,
        pattern: Option<&str>,
        field: Option<&str>,
        count: bool,
        scroll: Option<&str>,
        limit: usize,
    ) -> Result<(Vec<NamedCount>, Option<String>)> {
        let conn = self.read_conn()?;

        let mut conditions = Vec::new();
        let mut params: Vec<SqlParam> = Vec::new();
        if let Some(field) = field {
            conditions.push("fields.field = ?".to_string());
            params.push(SqlParam::Text(field.to_string()));
        }
        if let Some(pattern) = pattern {
            conditions.push("tokens.token GLOB ?".to_string());
            params.push(SqlParam::Text(pattern.to_string()));
        }
        if let Some(scroll) = scroll {
            conditions.push("tokens.token > ?".to_string());
            params.push(SqlParam::Text(scroll.to_string()));
        }
        let where_sql = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let sql = match (count, field.is_some()) {
            (true, with_field) => {
                let field_join = if with_field {
                    " LEFT JOIN fields ON fields.fid = links.fid"
                } else {
                    ""
                };
                format!(
                    "SELECT tokens.token, COUNT(DISTINCT links.pid) FROM tokens \
                     LEFT JOIN links ON links.tid = tokens.tid{field_join}{where_sql} \
                     GROUP BY tokens.tid ORDER BY tokens.token LIMIT ?"
                )
            }
            (false, true) => format!(
                "SELECT DISTINCT tokens.token FROM tokens \
                 JOIN links ON links.tid = tokens.tid \
                 JOIN fields ON fields.fid = links.fid{where_sql} \
                 ORDER BY tokens.token LIMIT ?"
            ),
            (false, false) => {
                format!("SELECT tokens.token FROM tokens{where_sql} ORDER BY tokens.token LIMIT ?")
            }
        };
        params.push(SqlParam::Int(limit as i64));

        collect_named(&conn, &sql, params, count, limit)
    }
}

fn collect_named(
    conn: &rusqlite::Connection,
    sql: &str,
    params: Vec<SqlParam>,
    count: bool,
    limit: usize,
) -> Result<(Vec<NamedCount>, Option<String>)> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(rusqlite::params_from_iter(params))?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        results.push(NamedCount {
            value: row.get(0)?,
            count: if count { Some(row.get(1)?) } else { None },
        });
    }
    let next = if limit > 0 && results.len() == limit {
        results.last().map(|last| last.value.clone())
    } else {
        None
    };
    Ok((results, next))
}

/// Escape GLOB metacharacters so a literal path can anchor a GLOB pattern.
fn escape_glob(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            '*' => out.push_str("[*]"),
            '?' => out.push_str("[?]"),
            '[' => out.push_str("[[]"),
            ']' => out.push_str("[]]"),
            other => out.push(other),
        }
    }
    out
}
