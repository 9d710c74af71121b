//! The rule script language.
//!
//! Rules are short scripts over a fixed request-field vocabulary, parsed into
//! an AST at load time and executed by a tree-walking interpreter with no
//! access to the host environment:
//!
//! ```text
//! # comments run to end of line
//! if path contains "/admin" and client_ip != "127.0.0.1" {
//!     drop()
//! }
//! if path matches "^/api/v[0-9]+" {
//!     mark("api")
//! }
//! ```
//!
//! Fields: `method`, `path`, `version`, `body`, `client_ip`, `port`,
//! `header("Name")` (exact-key lookup, empty string when absent). Operators:
//! `==`, `!=`, `contains`, `matches` (literal regex, compiled at load),
//! combined with `and`, `or`, `not` and parentheses. Actions: `accept()`,
//! `drop()`, `mark("tag")`.

use regex::Regex;

/// A load-time failure: the rule file is excluded from the active set.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("line {line}: {message}")]
    Lex { line: usize, message: String },

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("line {line}: invalid regex {pattern:?}: {source}")]
    Regex {
        line: usize,
        pattern: String,
        source: regex::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    LParen,
    RParen,
    LBrace,
    RBrace,
    EqEq,
    BangEq,
    If,
    And,
    Or,
    Not,
    Contains,
    Matches,
    Accept,
    Drop,
    Mark,
    Header,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier '{name}'"),
            Token::Str(_) => "string literal".to_string(),
            Token::Int(n) => format!("integer {n}"),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::LBrace => "'{'".to_string(),
            Token::RBrace => "'}'".to_string(),
            Token::EqEq => "'=='".to_string(),
            Token::BangEq => "'!='".to_string(),
            other => format!("'{}'", format!("{other:?}").to_lowercase()),
        }
    }
}

#[derive(Clone)]
struct Spanned {
    token: Token,
    line: usize,
}

fn keyword(ident: &str) -> Option<Token> {
    match ident {
        "if" => Some(Token::If),
        "and" => Some(Token::And),
        "or" => Some(Token::Or),
        "not" => Some(Token::Not),
        "contains" => Some(Token::Contains),
        "matches" => Some(Token::Matches),
        "accept" => Some(Token::Accept),
        "drop" => Some(Token::Drop),
        "mark" => Some(Token::Mark),
        "header" => Some(Token::Header),
        _ => None,
    }
}

fn lex(source: &str) -> Result<Vec<Spanned>, ScriptError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1usize;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '#' => {
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '(' => {
                chars.next();
                tokens.push(Spanned { token: Token::LParen, line });
            }
            ')' => {
                chars.next();
                tokens.push(Spanned { token: Token::RParen, line });
            }
            '{' => {
                chars.next();
                tokens.push(Spanned { token: Token::LBrace, line });
            }
            '}' => {
                chars.next();
                tokens.push(Spanned { token: Token::RBrace, line });
            }
            '=' => {
                chars.next();
                if chars.next_if_eq(&'=').is_none() {
                    return Err(ScriptError::Lex {
                        line,
                        message: "expected '==' (single '=' is not an operator)".to_string(),
                    });
                }
                tokens.push(Spanned { token: Token::EqEq, line });
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_none() {
                    return Err(ScriptError::Lex {
                        line,
                        message: "expected '!=' (use 'not' for negation)".to_string(),
                    });
                }
                tokens.push(Spanned { token: Token::BangEq, line });
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('"') => value.push('"'),
                            Some('\\') => value.push('\\'),
                            Some('n') => value.push('\n'),
                            Some('r') => value.push('\r'),
                            Some('t') => value.push('\t'),
                            other => {
                                return Err(ScriptError::Lex {
                                    line,
                                    message: format!("invalid escape sequence: {other:?}"),
                                });
                            }
                        },
                        Some('\n') | None => {
                            return Err(ScriptError::Lex {
                                line,
                                message: "unterminated string literal".to_string(),
                            });
                        }
                        Some(c) => value.push(c),
                    }
                }
                tokens.push(Spanned { token: Token::Str(value), line });
            }
            c if c.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(&c) = chars.peek() {
                    if !c.is_ascii_digit() {
                        break;
                    }
                    digits.push(c);
                    chars.next();
                }
                let value = digits.parse::<i64>().map_err(|_| ScriptError::Lex {
                    line,
                    message: format!("integer literal out of range: {digits}"),
                })?;
                tokens.push(Spanned { token: Token::Int(value), line });
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if !c.is_ascii_alphanumeric() && c != '_' {
                        break;
                    }
                    ident.push(c);
                    chars.next();
                }
                let token = keyword(&ident).unwrap_or(Token::Ident(ident));
                tokens.push(Spanned { token, line });
            }
            other => {
                return Err(ScriptError::Lex {
                    line,
                    message: format!("unexpected character {other:?}"),
                });
            }
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// A compiled rule script, ready for repeated evaluation.
#[derive(Debug, Clone)]
pub struct Program {
    pub(crate) stmts: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub(crate) enum Stmt {
    Accept,
    Drop,
    Mark(String),
    If { cond: Expr, body: Vec<Stmt> },
}

#[derive(Debug, Clone)]
pub(crate) enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Eq(Operand, Operand),
    Ne(Operand, Operand),
    Contains(Operand, Operand),
    Matches(Operand, Regex),
}

#[derive(Debug, Clone)]
pub(crate) enum Operand {
    Field(Field),
    Str(String),
    Int(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Field {
    Method,
    Path,
    Version,
    Body,
    ClientIp,
    Port,
    Header(String),
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse a rule script into a [`Program`].
pub fn parse(source: &str) -> Result<Program, ScriptError> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let stmts = parser.stmts_until(None)?;
    Ok(Program { stmts })
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Spanned> {
        let spanned = self.tokens.get(self.pos).cloned();
        if spanned.is_some() {
            self.pos += 1;
        }
        spanned
    }

    /// Line of the token at the cursor, or of the last token for errors at
    /// end of input.
    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|s| s.line)
            .unwrap_or(1)
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::Parse {
            line: self.line(),
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: Token, context: &str) -> Result<(), ScriptError> {
        let line = self.line();
        match self.next() {
            Some(spanned) if spanned.token == expected => Ok(()),
            Some(spanned) => Err(ScriptError::Parse {
                line: spanned.line,
                message: format!(
                    "expected {} {context}, found {}",
                    expected.describe(),
                    spanned.token.describe()
                ),
            }),
            None => Err(ScriptError::Parse {
                line,
                message: format!("expected {} {context}, found end of input", expected.describe()),
            }),
        }
    }

    /// Parse statements until `terminator` (or end of input when `None`).
    fn stmts_until(&mut self, terminator: Option<Token>) -> Result<Vec<Stmt>, ScriptError> {
        let mut stmts = Vec::new();
        loop {
            let at_terminator = match self.peek() {
                None => {
                    if let Some(term) = terminator {
                        return Err(self.error(format!(
                            "expected {} before end of input",
                            term.describe()
                        )));
                    }
                    return Ok(stmts);
                }
                Some(spanned) => Some(&spanned.token) == terminator.as_ref(),
            };
            if at_terminator {
                self.pos += 1;
                return Ok(stmts);
            }
            stmts.push(self.stmt()?);
        }
    }

    fn stmt(&mut self) -> Result<Stmt, ScriptError> {
        let line = self.line();
        let token = match self.next() {
            Some(spanned) => spanned.token,
            None => {
                return Err(ScriptError::Parse {
                    line,
                    message: "expected a statement".to_string(),
                });
            }
        };
        match token {
            Token::Accept => {
                self.expect(Token::LParen, "after 'accept'")?;
                self.expect(Token::RParen, "to close 'accept('")?;
                Ok(Stmt::Accept)
            }
            Token::Drop => {
                self.expect(Token::LParen, "after 'drop'")?;
                self.expect(Token::RParen, "to close 'drop('")?;
                Ok(Stmt::Drop)
            }
            Token::Mark => {
                self.expect(Token::LParen, "after 'mark'")?;
                let tag = match self.next() {
                    Some(Spanned { token: Token::Str(tag), .. }) => tag,
                    _ => {
                        return Err(ScriptError::Parse {
                            line,
                            message: "mark(...) takes a string tag".to_string(),
                        });
                    }
                };
                self.expect(Token::RParen, "to close 'mark('")?;
                Ok(Stmt::Mark(tag))
            }
            Token::If => {
                let cond = self.expr()?;
                self.expect(Token::LBrace, "to open the 'if' body")?;
                let body = self.stmts_until(Some(Token::RBrace))?;
                Ok(Stmt::If { cond, body })
            }
            other => Err(ScriptError::Parse {
                line,
                message: format!("expected a statement, found {}", other.describe()),
            }),
        }
    }

    fn expr(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.and_expr()?;
        while matches!(self.peek(), Some(Spanned { token: Token::Or, .. })) {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.unary()?;
        while matches!(self.peek(), Some(Spanned { token: Token::And, .. })) {
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ScriptError> {
        match self.peek() {
            Some(Spanned { token: Token::Not, .. }) => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            Some(Spanned { token: Token::LParen, .. }) => {
                self.pos += 1;
                let inner = self.expr()?;
                self.expect(Token::RParen, "to close the group")?;
                Ok(inner)
            }
            _ => self.comparison(),
        }
    }

    fn comparison(&mut self) -> Result<Expr, ScriptError> {
        let left = self.operand()?;
        let line = self.line();
        match self.next().map(|s| s.token) {
            Some(Token::EqEq) => Ok(Expr::Eq(left, self.operand()?)),
            Some(Token::BangEq) => Ok(Expr::Ne(left, self.operand()?)),
            Some(Token::Contains) => Ok(Expr::Contains(left, self.operand()?)),
            Some(Token::Matches) => {
                let pattern = match self.next() {
                    Some(Spanned { token: Token::Str(pattern), .. }) => pattern,
                    _ => {
                        return Err(ScriptError::Parse {
                            line,
                            message: "'matches' needs a literal regex pattern".to_string(),
                        });
                    }
                };
                let regex = Regex::new(&pattern).map_err(|source| ScriptError::Regex {
                    line,
                    pattern,
                    source,
                })?;
                Ok(Expr::Matches(left, regex))
            }
            Some(other) => Err(ScriptError::Parse {
                line,
                message: format!(
                    "expected a comparison operator, found {}",
                    other.describe()
                ),
            }),
            None => Err(ScriptError::Parse {
                line,
                message: "expected a comparison operator, found end of input".to_string(),
            }),
        }
    }

    fn operand(&mut self) -> Result<Operand, ScriptError> {
        let line = self.line();
        match self.next().map(|s| s.token) {
            Some(Token::Str(value)) => Ok(Operand::Str(value)),
            Some(Token::Int(value)) => Ok(Operand::Int(value)),
            Some(Token::Header) => {
                self.expect(Token::LParen, "after 'header'")?;
                let name = match self.next() {
                    Some(Spanned { token: Token::Str(name), .. }) => name,
                    _ => {
                        return Err(ScriptError::Parse {
                            line,
                            message: "header(...) takes a string name".to_string(),
                        });
                    }
                };
                self.expect(Token::RParen, "to close 'header('")?;
                Ok(Operand::Field(Field::Header(name)))
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "method" => Ok(Operand::Field(Field::Method)),
                "path" => Ok(Operand::Field(Field::Path)),
                "version" => Ok(Operand::Field(Field::Version)),
                "body" => Ok(Operand::Field(Field::Body)),
                "client_ip" => Ok(Operand::Field(Field::ClientIp)),
                "port" => Ok(Operand::Field(Field::Port)),
                _ => Err(ScriptError::Parse {
                    line,
                    message: format!("unknown request field '{name}'"),
                }),
            },
            Some(other) => Err(ScriptError::Parse {
                line,
                message: format!("expected a value or request field, found {}", other.describe()),
            }),
            None => Err(ScriptError::Parse {
                line,
                message: "expected a value or request field, found end of input".to_string(),
            }),
        }
    }
}
