//! Boolean word expressions.
//!
//! An expression is built from words, parentheses and the operators `and`,
//! `or` and `not` (binding tightest to loosest: `not`, `and`, `or`). Each
//! word is evaluated to true or false by a caller-supplied predicate, which
//! lets the same language express dependency result filters (`pass or diff`)
//! and keyword selections (`fast and not (mpi or gpu)`).
//!
//! An empty expression evaluates to false.

use std::fmt;

/// Errors produced while parsing an expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExprError {
    #[error("unexpected end of expression '{0}'")]
    UnexpectedEnd(String),

    #[error("unexpected token '{token}' in expression '{expr}'")]
    UnexpectedToken { token: String, expr: String },

    #[error("unbalanced parenthesis in expression '{0}'")]
    Unbalanced(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Word(String),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    False,
}

impl Node {
    fn evaluate(&self, pred: &dyn Fn(&str) -> bool) -> bool {
        match self {
            Node::Word(w) => pred(w),
            Node::Not(n) => !n.evaluate(pred),
            Node::And(a, b) => a.evaluate(pred) && b.evaluate(pred),
            Node::Or(a, b) => a.evaluate(pred) || b.evaluate(pred),
            Node::False => false,
        }
    }
}

/// A parsed boolean expression over words.
///
/// # Example
///
/// ```
/// use vvtest::depend::WordExpression;
///
/// let expr = WordExpression::parse("pass or diff").unwrap();
/// assert!(expr.evaluate(|w| w == "diff"));
/// assert!(!expr.evaluate(|w| w == "fail"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordExpression {
    source: String,
    root: Node,
}

impl WordExpression {
    /// Parses an expression string.
    pub fn parse(expr: &str) -> Result<Self, ExprError> {
        let source = expr.split_whitespace().collect::<Vec<_>>().join(" ");
        let tokens = tokenize(expr);
        let root = if tokens.is_empty() {
            Node::False
        } else {
            let mut parser = Parser {
                tokens: &tokens,
                pos: 0,
                source: &source,
            };
            let root = parser.parse_or()?;
            if let Some(tok) = parser.peek() {
                return Err(if tok == ")" {
                    ExprError::Unbalanced(source.clone())
                } else {
                    ExprError::UnexpectedToken {
                        token: tok.to_string(),
                        expr: source.clone(),
                    }
                });
            }
            root
        };
        Ok(Self { source, root })
    }

    /// Builds an expression from command-line keyword groups.
    ///
    /// Within a group, words separated by `/` are alternatives and a leading
    /// `!` negates a word; separate groups must all hold. So
    /// `["key1/key2", "!key3"]` becomes `(key1 or key2) and (not key3)`.
    pub fn from_keyword_groups<S: AsRef<str>>(groups: &[S]) -> Result<Self, ExprError> {
        let mut clauses = Vec::new();
        for group in groups {
            let mut alternatives = Vec::new();
            for word in group.as_ref().split('/') {
                let mut word = word.trim();
                let mut negate = false;
                while let Some(rest) = word.strip_prefix('!') {
                    negate = !negate;
                    word = rest.trim();
                }
                if word.is_empty() {
                    continue;
                }
                if negate {
                    alternatives.push(format!("not {}", word));
                } else {
                    alternatives.push(word.to_string());
                }
            }
            if !alternatives.is_empty() {
                clauses.push(format!("( {} )", alternatives.join(" or ")));
            }
        }
        Self::parse(&clauses.join(" and "))
    }

    /// Evaluates the expression, resolving each word with `pred`.
    pub fn evaluate<F>(&self, pred: F) -> bool
    where
        F: Fn(&str) -> bool,
    {
        self.root.evaluate(&pred)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for WordExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for WordExpression {
    type Err = ExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn tokenize(expr: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in expr.chars() {
        if c == '(' || c == ')' || c.is_whitespace() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            if !c.is_whitespace() {
                tokens.push(c.to_string());
            }
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

struct Parser<'a> {
    tokens: &'a [String],
    pos: usize,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.pos).map(String::as_str)
    }

    fn next(&mut self) -> Option<&'a str> {
        let tok = self.tokens.get(self.pos).map(String::as_str);
        self.pos += 1;
        tok
    }

    fn parse_or(&mut self) -> Result<Node, ExprError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some("or") {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Node::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Node, ExprError> {
        let mut lhs = self.parse_not()?;
        while self.peek() == Some("and") {
            self.pos += 1;
            let rhs = self.parse_not()?;
            lhs = Node::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Node, ExprError> {
        if self.peek() == Some("not") {
            self.pos += 1;
            let operand = self.parse_not()?;
            return Ok(Node::Not(Box::new(operand)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Node, ExprError> {
        let source = self.source;
        match self.next() {
            None => Err(ExprError::UnexpectedEnd(source.to_string())),
            Some("(") => {
                // An empty group evaluates to false.
                if self.peek() == Some(")") {
                    self.pos += 1;
                    return Ok(Node::False);
                }
                let inner = self.parse_or()?;
                match self.next() {
                    Some(")") => Ok(inner),
                    _ => Err(ExprError::Unbalanced(source.to_string())),
                }
            }
            Some(")") => Err(ExprError::Unbalanced(source.to_string())),
            Some(tok @ ("and" | "or" | "not")) => Err(ExprError::UnexpectedToken {
                token: tok.to_string(),
                expr: source.to_string(),
            }),
            Some(word) => Ok(Node::Word(word.to_string())),
        }
    }
}
