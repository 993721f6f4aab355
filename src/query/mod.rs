//! Search-clause data model.
//!
//! Clauses arrive as JSON with a discriminating `type` field, are sanitized
//! into a canonical form, and are finally assembled into a parameterized SQL
//! predicate over the index.

use serde::{Deserialize, Serialize};

mod sanitize;
mod sql;
mod translate;

pub use sanitize::sanitize;
pub use sql::{assemble_filter, Filter, Order, Scroll, SqlParam};
pub use translate::{translate_query, translate_text_query};

/// One node of a search-clause tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Clause {
    /// Match one token, optionally restricted to a field. `is_pattern` marks
    /// the token as a SQL LIKE pattern rather than an exact match.
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_pattern: bool,
    },
    /// Exact owner match.
    User { user: String },
    /// Substring (default), prefix, or suffix match on the absolute path.
    /// A caller-supplied `escape` marks `path` as an already-escaped LIKE
    /// pattern.
    Path {
        path: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_prefix: bool,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_suffix: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        escape: Option<String>,
    },
    /// Modification-time bound: `time <= ?` by default, `time > ?` when
    /// `after` is set.
    Time {
        time: i64,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        after: bool,
    },
    And { children: Vec<Clause> },
    Or { children: Vec<Clause> },
    Not { child: Box<Clause> },
}
