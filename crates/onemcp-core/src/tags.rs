//! Tag filters: the boolean predicate scoping a session to upstreams.
//!
//! Three forms, all evaluating purely against a server's tag set:
//! - `AnyOf`: the simple comma-list form (`?tags=db,web`), true when any
//!   listed tag is present
//! - `Expr`: the advanced form (`?tag-filter=db and not legacy`), a small
//!   `and`/`or`/`not` grammar with parentheses
//! - `All`: no filter, admits every upstream
//!
//! Presets resolve to one of these before a session stores its filter.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::ConfigError;

/// A boolean expression over tag membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagExpr {
    Tag(String),
    Not(Box<TagExpr>),
    And(Box<TagExpr>, Box<TagExpr>),
    Or(Box<TagExpr>, Box<TagExpr>),
}

impl TagExpr {
    pub fn matches(&self, tags: &BTreeSet<String>) -> bool {
        match self {
            TagExpr::Tag(tag) => tags.contains(tag),
            TagExpr::Not(inner) => !inner.matches(tags),
            TagExpr::And(a, b) => a.matches(tags) && b.matches(tags),
            TagExpr::Or(a, b) => a.matches(tags) || b.matches(tags),
        }
    }
}

impl fmt::Display for TagExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagExpr::Tag(tag) => write!(f, "{tag}"),
            TagExpr::Not(inner) => write!(f, "not ({inner})"),
            TagExpr::And(a, b) => write!(f, "({a}) and ({b})"),
            TagExpr::Or(a, b) => write!(f, "({a}) or ({b})"),
        }
    }
}

/// A session's upstream selection predicate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TagFilter {
    /// No filter: every upstream is admitted.
    #[default]
    All,
    /// Simple OR over a tag list.
    AnyOf(Vec<String>),
    /// Advanced boolean expression.
    Expr(TagExpr),
}

impl TagFilter {
    /// Build the simple form from a comma-separated list; empty input means
    /// no filter.
    pub fn from_tag_list(raw: &str) -> TagFilter {
        let tags: Vec<String> = raw
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if tags.is_empty() {
            TagFilter::All
        } else {
            TagFilter::AnyOf(tags)
        }
    }

    /// Parse the advanced expression form.
    pub fn from_expression(raw: &str) -> Result<TagFilter, ConfigError> {
        Ok(TagFilter::Expr(parse_expression(raw)?))
    }

    /// Pure evaluation against an upstream's tag set.
    pub fn matches(&self, tags: &BTreeSet<String>) -> bool {
        match self {
            TagFilter::All => true,
            TagFilter::AnyOf(wanted) => wanted.iter().any(|t| tags.contains(t)),
            TagFilter::Expr(expr) => expr.matches(tags),
        }
    }

    /// The tag names this filter mentions; used for `tag:<name>` scope
    /// authorization.
    pub fn referenced_tags(&self) -> BTreeSet<String> {
        fn walk(expr: &TagExpr, out: &mut BTreeSet<String>) {
            match expr {
                TagExpr::Tag(tag) => {
                    out.insert(tag.clone());
                }
                TagExpr::Not(inner) => walk(inner, out),
                TagExpr::And(a, b) | TagExpr::Or(a, b) => {
                    walk(a, out);
                    walk(b, out);
                }
            }
        }
        let mut out = BTreeSet::new();
        match self {
            TagFilter::All => {}
            TagFilter::AnyOf(tags) => out.extend(tags.iter().cloned()),
            TagFilter::Expr(expr) => walk(expr, &mut out),
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Expression parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Tag(String),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConfigError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '&' => {
                chars.next();
                if chars.peek() == Some(&'&') {
                    chars.next();
                }
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                if chars.peek() == Some(&'|') {
                    chars.next();
                }
                tokens.push(Token::Or);
            }
            c if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == ':' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == ':' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.to_ascii_lowercase().as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    _ => tokens.push(Token::Tag(word)),
                }
            }
            other => {
                return Err(ConfigError::InvalidTagExpression(format!(
                    "unexpected character '{other}'"
                )));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    // or := and ("or" and)*
    fn parse_or(&mut self) -> Result<TagExpr, ConfigError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = TagExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // and := unary ("and" unary)*
    fn parse_and(&mut self) -> Result<TagExpr, ConfigError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_unary()?;
            left = TagExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // unary := "not" unary | "(" or ")" | tag
    fn parse_unary(&mut self) -> Result<TagExpr, ConfigError> {
        match self.next() {
            Some(Token::Not) => Ok(TagExpr::Not(Box::new(self.parse_unary()?))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ConfigError::InvalidTagExpression(
                        "missing closing parenthesis".into(),
                    )),
                }
            }
            Some(Token::Tag(tag)) => Ok(TagExpr::Tag(tag)),
            other => Err(ConfigError::InvalidTagExpression(format!(
                "expected tag, 'not' or '(', found {other:?}"
            ))),
        }
    }
}

fn parse_expression(input: &str) -> Result<TagExpr, ConfigError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ConfigError::InvalidTagExpression("empty expression".into()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(ConfigError::InvalidTagExpression(format!(
            "trailing tokens after expression: {:?}",
            &parser.tokens[parser.pos..]
        )));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn all_admits_everything() {
        assert!(TagFilter::All.matches(&tags(&[])));
        assert!(TagFilter::All.matches(&tags(&["db"])));
    }

    #[test]
    fn any_of_is_an_or() {
        let filter = TagFilter::from_tag_list("db, web");
        assert!(filter.matches(&tags(&["db"])));
        assert!(filter.matches(&tags(&["web", "other"])));
        assert!(!filter.matches(&tags(&["other"])));
    }

    #[test]
    fn empty_tag_list_means_no_filter() {
        assert_eq!(TagFilter::from_tag_list(""), TagFilter::All);
        assert_eq!(TagFilter::from_tag_list(" , "), TagFilter::All);
    }

    #[test]
    fn expression_operators() {
        let filter = TagFilter::from_expression("db and not legacy").unwrap();
        assert!(filter.matches(&tags(&["db"])));
        assert!(!filter.matches(&tags(&["db", "legacy"])));
        assert!(!filter.matches(&tags(&["web"])));

        let filter = TagFilter::from_expression("(db or web) and prod").unwrap();
        assert!(filter.matches(&tags(&["db", "prod"])));
        assert!(filter.matches(&tags(&["web", "prod"])));
        assert!(!filter.matches(&tags(&["db"])));
    }

    #[test]
    fn symbolic_operators() {
        let filter = TagFilter::from_expression("db && !legacy").unwrap();
        assert!(filter.matches(&tags(&["db"])));
        assert!(!filter.matches(&tags(&["db", "legacy"])));

        let filter = TagFilter::from_expression("db || web").unwrap();
        assert!(filter.matches(&tags(&["web"])));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        // a or b and c  ==  a or (b and c)
        let filter = TagFilter::from_expression("a or b and c").unwrap();
        assert!(filter.matches(&tags(&["a"])));
        assert!(filter.matches(&tags(&["b", "c"])));
        assert!(!filter.matches(&tags(&["b"])));
    }

    #[test]
    fn malformed_expressions_rejected() {
        assert!(TagFilter::from_expression("").is_err());
        assert!(TagFilter::from_expression("and db").is_err());
        assert!(TagFilter::from_expression("(db").is_err());
        assert!(TagFilter::from_expression("db web").is_err());
        assert!(TagFilter::from_expression("db @ web").is_err());
    }

    #[test]
    fn referenced_tags_collects_terms() {
        let filter = TagFilter::from_expression("(db or web) and not legacy").unwrap();
        assert_eq!(filter.referenced_tags(), tags(&["db", "web", "legacy"]));

        let filter = TagFilter::from_tag_list("a,b");
        assert_eq!(filter.referenced_tags(), tags(&["a", "b"]));
    }
}
