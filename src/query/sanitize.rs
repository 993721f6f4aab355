//! Clause sanitization into canonical form.

use anyhow::{bail, Result};

use super::Clause;
use crate::tokenize::Tokenizer;

// Candidates for the LIKE escape character, tried in order.
const ESCAPE_CANDIDATES: &[char] = &['\\', '~', '!', '@', '#', '$', '^', '&'];

/// Sanitize a clause tree into an equivalent canonical clause.
///
/// Boolean nodes are flattened and collapsed, text leaves are tokenized (a
/// multi-token text becomes an `and` of per-token clauses), and path leaves
/// become ready-to-use LIKE patterns with an escape character. `None` means
/// the clause matched nothing at all, e.g. text with no tokens.
pub fn sanitize(clause: &Clause) -> Result<Option<Clause>> {
    match clause {
        Clause::And { children } => sanitize_combination(children, false),
        Clause::Or { children } => sanitize_combination(children, true),

        Clause::Not { child } => match sanitize(child)? {
            None => Ok(None),
            Some(Clause::Not { child }) => Ok(Some(*child)),
            Some(inner) => Ok(Some(Clause::Not {
                child: Box::new(inner),
            })),
        },

        Clause::Text {
            text,
            field,
            is_pattern,
        } => {
            let tokens = Tokenizer::new(*is_pattern).tokenize(text);
            let mut leaves: Vec<Clause> = tokens
                .into_iter()
                .map(|token| Clause::Text {
                    text: token,
                    field: field.clone(),
                    is_pattern: *is_pattern,
                })
                .collect();
            match leaves.len() {
                0 => Ok(None),
                1 => Ok(Some(leaves.pop().expect("one leaf"))),
                _ => Ok(Some(Clause::And { children: leaves })),
            }
        }

        Clause::Path {
            path,
            is_prefix,
            is_suffix,
            escape,
        } => {
            let (pattern, escape) = match escape {
                Some(escape) => {
                    let mut chars = escape.chars();
                    match (chars.next(), chars.next()) {
                        (Some(_), None) => {}
                        _ => bail!("escape must be a single character, got {escape:?}"),
                    }
                    // Caller already escaped the pattern; use it verbatim.
                    (path.clone(), escape.clone())
                }
                None => {
                    let escape = choose_escape(path)?;
                    let mut pattern = String::with_capacity(path.len() + 2);
                    if !is_prefix {
                        pattern.push('%');
                    }
                    for c in path.chars() {
                        if c == '%' || c == '_' {
                            pattern.push(escape);
                        }
                        pattern.push(c);
                    }
                    if !is_suffix {
                        pattern.push('%');
                    }
                    (pattern, escape.to_string())
                }
            };
            Ok(Some(Clause::Path {
                path: pattern,
                is_prefix: false,
                is_suffix: false,
                escape: Some(escape),
            }))
        }

        Clause::User { .. } | Clause::Time { .. } => Ok(Some(clause.clone())),
    }
}

fn sanitize_combination(children: &[Clause], is_or: bool) -> Result<Option<Clause>> {
    let mut kept = Vec::with_capacity(children.len());
    for child in children {
        let Some(child) = sanitize(child)? else {
            continue;
        };
        // Flatten a same-typed child one level; recursion has already
        // flattened anything deeper.
        match child {
            Clause::Or { children } if is_or => kept.extend(children),
            Clause::And { children } if !is_or => kept.extend(children),
            other => kept.push(other),
        }
    }
    match kept.len() {
        0 => Ok(None),
        1 => Ok(Some(kept.pop().expect("one child"))),
        _ => Ok(Some(if is_or {
            Clause::Or { children: kept }
        } else {
            Clause::And { children: kept }
        })),
    }
}

fn choose_escape(path: &str) -> Result<char> {
    for candidate in ESCAPE_CANDIDATES {
        if !path.contains(*candidate) {
            return Ok(*candidate);
        }
    }
    bail!("no usable escape character for path pattern {path:?}")
}
