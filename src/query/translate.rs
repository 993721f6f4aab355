//! Translation of human-readable boolean search strings into clause trees.
//!
//! Grammar: whitespace-separated terms, parentheses for grouping, all-caps
//! `AND`/`OR`/`NOT` operators. Adjacent terms form one implicit-AND group; a
//! `field:` prefix on such a group scopes its terms to that field. Precedence
//! strongest-first: parentheses, NOT, AND, OR.

use anyhow::{bail, Result};

use super::Clause;

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Open,
    Close,
}

fn lex(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    for c in input.chars() {
        match c {
            '(' | ')' => {
                if !word.is_empty() {
                    tokens.push(Token::Word(std::mem::take(&mut word)));
                }
                tokens.push(if c == '(' { Token::Open } else { Token::Close });
            }
            c if c.is_whitespace() => {
                if !word.is_empty() {
                    tokens.push(Token::Word(std::mem::take(&mut word)));
                }
            }
            c => word.push(c),
        }
    }
    if !word.is_empty() {
        tokens.push(Token::Word(word));
    }
    tokens
}

#[derive(Default)]
struct Group {
    words: Vec<String>,
    clauses: Vec<Clause>,
    // true for AND, false for OR; always one shorter than `clauses`.
    ands: Vec<bool>,
    negated: bool,
}

impl Group {
    fn expects_operand(&self) -> bool {
        self.clauses.len() == self.ands.len()
    }

    fn push_operand(&mut self, clause: Clause) {
        let clause = if self.negated {
            self.negated = false;
            Clause::Not {
                child: Box::new(clause),
            }
        } else {
            clause
        };
        if !self.expects_operand() {
            // Adjacent operands with no explicit operator are AND'd.
            self.ands.push(true);
        }
        self.clauses.push(clause);
    }

    fn flush_words(&mut self) -> Result<()> {
        if self.words.is_empty() {
            return Ok(());
        }
        let words = std::mem::take(&mut self.words);

        let mut field = None;
        let mut first = words[0].clone();
        if let Some(idx) = first.find(':') {
            if idx > 0 {
                field = Some(first[..idx].to_string());
                first = first[idx + 1..].to_string();
            }
        }

        let mut parts: Vec<&str> = Vec::with_capacity(words.len());
        if !first.is_empty() {
            parts.push(&first);
        }
        for word in &words[1..] {
            parts.push(word);
        }
        if parts.is_empty() {
            bail!("no search terms after field {:?}", field.unwrap_or_default());
        }
        let text = parts.join(" ");
        let is_pattern = text.contains(['*', '?', '%', '_']);

        self.push_operand(Clause::Text {
            text,
            field,
            is_pattern,
        });
        Ok(())
    }

    fn resolve(self) -> Result<Clause> {
        if self.negated {
            bail!("trailing NOT in search query");
        }
        if self.clauses.is_empty() {
            bail!("no search terms in query");
        }
        if self.expects_operand() {
            bail!("trailing AND/OR in search query");
        }

        // AND binds tighter than OR: fold consecutive AND runs first.
        let mut or_operands = Vec::new();
        let mut run = Vec::new();
        let mut clauses = self.clauses.into_iter();
        run.push(clauses.next().expect("at least one clause"));
        for (is_and, clause) in self.ands.into_iter().zip(clauses) {
            if is_and {
                run.push(clause);
            } else {
                or_operands.push(combine_run(std::mem::take(&mut run)));
                run.push(clause);
            }
        }
        or_operands.push(combine_run(run));

        Ok(if or_operands.len() == 1 {
            or_operands.pop().expect("one operand")
        } else {
            Clause::Or {
                children: or_operands,
            }
        })
    }
}

fn combine_run(mut run: Vec<Clause>) -> Clause {
    if run.len() == 1 {
        run.pop().expect("one clause")
    } else {
        Clause::And { children: run }
    }
}

fn parse_group<I: Iterator<Item = Token>>(tokens: &mut I, nested: bool) -> Result<Clause> {
    let mut group = Group::default();
    let mut closed = false;

    while let Some(token) = tokens.next() {
        match token {
            Token::Word(word) => match word.as_str() {
                "AND" | "OR" => {
                    group.flush_words()?;
                    if group.negated || group.expects_operand() {
                        bail!("operator {word} with no preceding search term");
                    }
                    group.ands.push(word == "AND");
                }
                "NOT" => {
                    if !group.words.is_empty() || group.negated {
                        bail!("misplaced NOT in search query");
                    }
                    group.negated = true;
                }
                _ => group.words.push(word),
            },
            Token::Open => {
                group.flush_words()?;
                let inner = parse_group(tokens, true)?;
                group.push_operand(inner);
            }
            Token::Close => {
                if !nested {
                    bail!("unmatched ) in search query");
                }
                closed = true;
                break;
            }
        }
    }

    if nested && !closed {
        bail!("unmatched ( in search query");
    }
    group.flush_words()?;
    group.resolve()
}

/// Parse a free-form human search string into a clause tree. The result is
/// not yet sanitized.
pub fn translate_text_query(input: &str) -> Result<Clause> {
    parse_group(&mut lex(input).into_iter(), false)
}

/// Translate a query-level clause: text bodies are parsed by the grammar,
/// boolean nodes recurse, everything else passes through.
pub fn translate_query(clause: &Clause) -> Result<Clause> {
    match clause {
        Clause::Text { text, .. } => translate_text_query(text),
        Clause::And { children } => Ok(Clause::And {
            children: children
                .iter()
                .map(translate_query)
                .collect::<Result<Vec<_>>>()?,
        }),
        Clause::Or { children } => Ok(Clause::Or {
            children: children
                .iter()
                .map(translate_query)
                .collect::<Result<Vec<_>>>()?,
        }),
        Clause::Not { child } => Ok(Clause::Not {
            child: Box::new(translate_query(child)?),
        }),
        other => Ok(other.clone()),
    }
}
