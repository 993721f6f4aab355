//! Assembly of sanitized clauses into parameterized SQL predicates, plus
//! result ordering and scroll-cursor handling.

use anyhow::{anyhow, bail, Result};
use rusqlite::types::ToSqlOutput;
use rusqlite::ToSql;

use super::Clause;

/// A positional parameter for an assembled predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            SqlParam::Text(s) => s.to_sql(),
            SqlParam::Int(i) => i.to_sql(),
        }
    }
}

/// A WHERE fragment over the `paths` table and its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

/// Walk a sanitized clause tree and emit its SQL predicate. Expects
/// [`sanitize`](super::sanitize) output; unsanitized text will simply fail to
/// match anything.
pub fn assemble_filter(clause: &Clause) -> Filter {
    match clause {
        Clause::Text {
            text,
            field,
            is_pattern,
        } => text_subselect(&[(field.as_deref(), text, *is_pattern)]),

        Clause::User { user } => Filter {
            sql: "paths.user = ?".to_string(),
            params: vec![SqlParam::Text(user.clone())],
        },

        Clause::Path { path, escape, .. } => {
            let mut params = vec![SqlParam::Text(path.clone())];
            let sql = match escape {
                Some(escape) => {
                    params.push(SqlParam::Text(escape.clone()));
                    "paths.path LIKE ? ESCAPE ?".to_string()
                }
                None => "paths.path LIKE ?".to_string(),
            };
            Filter { sql, params }
        }

        Clause::Time { time, after } => Filter {
            sql: if *after {
                "paths.time > ?".to_string()
            } else {
                "paths.time <= ?".to_string()
            },
            params: vec![SqlParam::Int(*time)],
        },

        Clause::And { children } => {
            let mut pieces = Vec::with_capacity(children.len());
            let mut params = Vec::new();
            for child in children {
                let filter = assemble_filter(child);
                pieces.push(filter.sql);
                params.extend(filter.params);
            }
            Filter {
                sql: format!("({})", pieces.join(" AND ")),
                params,
            }
        }

        Clause::Or { children } => {
            // Merge all text siblings into a single subselect so SQLite scans
            // the links join once with an OR'd token predicate.
            let mut texts = Vec::new();
            let mut others = Vec::new();
            for child in children {
                match child {
                    Clause::Text {
                        text,
                        field,
                        is_pattern,
                    } => texts.push((field.as_deref(), text.as_str(), *is_pattern)),
                    other => others.push(other),
                }
            }

            let mut pieces = Vec::new();
            let mut params = Vec::new();
            if !texts.is_empty() {
                let merged = text_subselect(&texts);
                pieces.push(merged.sql);
                params.extend(merged.params);
            }
            for other in others {
                let filter = assemble_filter(other);
                pieces.push(filter.sql);
                params.extend(filter.params);
            }
            Filter {
                sql: format!("({})", pieces.join(" OR ")),
                params,
            }
        }

        Clause::Not { child } => {
            let inner = assemble_filter(child);
            Filter {
                sql: format!("NOT {}", parenthesize(inner.sql)),
                params: inner.params,
            }
        }
    }
}

fn parenthesize(sql: String) -> String {
    if sql.starts_with('(') {
        sql
    } else {
        format!("({sql})")
    }
}

fn text_subselect(texts: &[(Option<&str>, &str, bool)]) -> Filter {
    let any_field = texts.iter().any(|(field, _, _)| field.is_some());

    let mut sql =
        String::from("paths.pid IN (SELECT pid FROM links LEFT JOIN tokens ON tokens.tid = links.tid");
    if any_field {
        sql.push_str(" LEFT JOIN fields ON fields.fid = links.fid");
    }
    sql.push_str(" WHERE ");

    let mut params = Vec::new();
    for (i, (field, token, is_pattern)) in texts.iter().enumerate() {
        if i > 0 {
            sql.push_str(" OR ");
        }
        let op = if *is_pattern { "LIKE" } else { "=" };
        match field {
            Some(field) => {
                sql.push_str(&format!("(fields.field = ? AND tokens.token {op} ?)"));
                params.push(SqlParam::Text((*field).to_string()));
            }
            None => {
                sql.push_str(&format!("tokens.token {op} ?"));
            }
        }
        params.push(SqlParam::Text((*token).to_string()));
    }
    sql.push(')');
    Filter { sql, params }
}

/// Result ordering. The default sorts newest first with `pid` breaking ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    TimeDesc,
    TimeAsc,
    PathAsc,
    PathDesc,
}

impl Order {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "time" => Ok(Order::TimeAsc),
            "-time" => Ok(Order::TimeDesc),
            "path" => Ok(Order::PathAsc),
            "-path" => Ok(Order::PathDesc),
            other => bail!("unknown order {other:?}"),
        }
    }

    pub fn sql(self) -> &'static str {
        match self {
            Order::TimeDesc => "paths.time DESC, paths.pid DESC",
            Order::TimeAsc => "paths.time ASC, paths.pid ASC",
            Order::PathAsc => "paths.path ASC",
            Order::PathDesc => "paths.path DESC",
        }
    }
}

/// A scroll cursor: the ordering columns of the last row of the previous
/// page. Time orders compare the `(time, pid)` row value; path orders compare
/// the unique path.
#[derive(Debug, Clone, PartialEq)]
pub enum Scroll {
    Time { time: i64, pid: i64 },
    Path { path: String },
}

impl Scroll {
    /// Parse the opaque wire form of a cursor for the given ordering.
    pub fn parse(raw: &str, order: Order) -> Result<Self> {
        match order {
            Order::TimeAsc | Order::TimeDesc => {
                let (time, pid) = raw
                    .split_once(',')
                    .ok_or_else(|| anyhow!("invalid scroll {raw:?}"))?;
                Ok(Scroll::Time {
                    time: time
                        .parse()
                        .map_err(|_| anyhow!("invalid scroll time in {raw:?}"))?,
                    pid: pid
                        .parse()
                        .map_err(|_| anyhow!("invalid scroll pid in {raw:?}"))?,
                })
            }
            Order::PathAsc | Order::PathDesc => Ok(Scroll::Path {
                path: raw.to_string(),
            }),
        }
    }

    /// Build the cursor for a result row under the given ordering.
    pub fn for_row(order: Order, time: i64, pid: i64, path: &str) -> Self {
        match order {
            Order::TimeAsc | Order::TimeDesc => Scroll::Time { time, pid },
            Order::PathAsc | Order::PathDesc => Scroll::Path {
                path: path.to_string(),
            },
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Scroll::Time { time, pid } => format!("{time},{pid}"),
            Scroll::Path { path } => path.clone(),
        }
    }

    /// The next-page predicate matching the ordering direction.
    pub fn predicate(&self, order: Order) -> Result<(String, Vec<SqlParam>)> {
        match (self, order) {
            (Scroll::Time { time, pid }, Order::TimeDesc) => Ok((
                "(paths.time, paths.pid) < (?, ?)".to_string(),
                vec![SqlParam::Int(*time), SqlParam::Int(*pid)],
            )),
            (Scroll::Time { time, pid }, Order::TimeAsc) => Ok((
                "(paths.time, paths.pid) > (?, ?)".to_string(),
                vec![SqlParam::Int(*time), SqlParam::Int(*pid)],
            )),
            (Scroll::Path { path }, Order::PathAsc) => Ok((
                "paths.path > ?".to_string(),
                vec![SqlParam::Text(path.clone())],
            )),
            (Scroll::Path { path }, Order::PathDesc) => Ok((
                "paths.path < ?".to_string(),
                vec![SqlParam::Text(path.clone())],
            )),
            (scroll, order) => bail!("scroll {scroll:?} does not match order {order:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(t: &str) -> Clause {
        Clause::Text {
            text: t.into(),
            field: None,
            is_pattern: false,
        }
    }

    #[test]
    fn text_without_field_uses_a_token_subselect() {
        let filter = assemble_filter(&text("aaron"));
        assert_eq!(
            filter.sql,
            "paths.pid IN (SELECT pid FROM links LEFT JOIN tokens ON tokens.tid = links.tid WHERE tokens.token = ?)"
        );
        assert_eq!(filter.params, vec![SqlParam::Text("aaron".into())]);
    }

    #[test]
    fn text_with_field_joins_fields() {
        let filter = assemble_filter(&Clause::Text {
            text: "hoshino".into(),
            field: Some("characters.first".into()),
            is_pattern: false,
        });
        assert!(filter.sql.contains("LEFT JOIN fields ON fields.fid = links.fid"));
        assert!(filter.sql.contains("fields.field = ? AND tokens.token = ?"));
        assert_eq!(
            filter.params,
            vec![
                SqlParam::Text("characters.first".into()),
                SqlParam::Text("hoshino".into()),
            ]
        );
    }

    #[test]
    fn pattern_text_uses_like() {
        let filter = assemble_filter(&Clause::Text {
            text: "lam%".into(),
            field: None,
            is_pattern: true,
        });
        assert!(filter.sql.contains("tokens.token LIKE ?"));
    }

    #[test]
    fn or_of_texts_merges_into_one_subselect() {
        let filter = assemble_filter(&Clause::Or {
            children: vec![text("foo"), text("bar")],
        });
        assert_eq!(
            filter.sql.matches("SELECT pid FROM links").count(),
            1,
            "expected a single merged subselect: {}",
            filter.sql
        );
        assert!(filter.sql.contains("tokens.token = ? OR tokens.token = ?"));
        assert_eq!(
            filter.params,
            vec![SqlParam::Text("foo".into()), SqlParam::Text("bar".into())]
        );
    }

    #[test]
    fn or_mixes_texts_with_other_predicates() {
        let filter = assemble_filter(&Clause::Or {
            children: vec![
                text("foo"),
                text("bar"),
                Clause::User {
                    user: "alice".into(),
                },
            ],
        });
        assert_eq!(filter.sql.matches("SELECT pid FROM links").count(), 1);
        assert!(filter.sql.ends_with("OR paths.user = ?)"));
    }

    #[test]
    fn and_not_time_and_path_compose() {
        let filter = assemble_filter(&Clause::And {
            children: vec![
                Clause::Time {
                    time: 100,
                    after: true,
                },
                Clause::Not {
                    child: Box::new(Clause::User {
                        user: "alice".into(),
                    }),
                },
                Clause::Path {
                    path: "%run1%".into(),
                    is_prefix: false,
                    is_suffix: false,
                    escape: Some("\\".into()),
                },
            ],
        });
        assert_eq!(
            filter.sql,
            "(paths.time > ? AND NOT (paths.user = ?) AND paths.path LIKE ? ESCAPE ?)"
        );
        assert_eq!(
            filter.params,
            vec![
                SqlParam::Int(100),
                SqlParam::Text("alice".into()),
                SqlParam::Text("%run1%".into()),
                SqlParam::Text("\\".into()),
            ]
        );
    }

    #[test]
    fn order_parsing() {
        assert_eq!(Order::parse("time").unwrap(), Order::TimeAsc);
        assert_eq!(Order::parse("-time").unwrap(), Order::TimeDesc);
        assert_eq!(Order::parse("path").unwrap(), Order::PathAsc);
        assert_eq!(Order::parse("-path").unwrap(), Order::PathDesc);
        assert!(Order::parse("size").is_err());
    }

    #[test]
    fn scroll_round_trips() {
        let scroll = Scroll::parse("123,45", Order::TimeDesc).unwrap();
        assert_eq!(scroll, Scroll::Time { time: 123, pid: 45 });
        assert_eq!(scroll.encode(), "123,45");

        let (sql, params) = scroll.predicate(Order::TimeDesc).unwrap();
        assert_eq!(sql, "(paths.time, paths.pid) < (?, ?)");
        assert_eq!(params, vec![SqlParam::Int(123), SqlParam::Int(45)]);

        let scroll = Scroll::parse("/data/a.json", Order::PathAsc).unwrap();
        let (sql, _) = scroll.predicate(Order::PathAsc).unwrap();
        assert_eq!(sql, "paths.path > ?");

        assert!(Scroll::parse("nonsense", Order::TimeAsc).is_err());
    }
}
