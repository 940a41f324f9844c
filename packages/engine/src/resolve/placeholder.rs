// ABOUTME: Parser for {{ ... }} placeholders embedded in env values, mounts, checks and workspace files
// ABOUTME: Produces literal text and typed placeholder expressions for the resolver

use std::fmt;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Which container a placeholder refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The container being resolved
    Current,
    Named(String),
    /// First container carrying the label; an empty value matches any value
    Labelled { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accessor {
    ExposedPort(u16),
    Hostname,
    Name,
    GetLabel(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    ExternalAddress,
    Container { target: Target, accessor: Accessor },
    /// `.key` lookup in a workspace substitution map
    Field(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Placeholder { source: String, expr: Expr },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Malformed(String),
    Unknown(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Malformed(reason) => write!(f, "{}", reason),
            ParseError::Unknown(token) => write!(f, "unknown placeholder '{}'", token),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Dot,
    Ident(String),
    Str(String),
    Int(u64),
    LParen,
    RParen,
}

fn malformed(reason: impl Into<String>) -> ParseError {
    ParseError::Malformed(reason.into())
}

fn lex(source: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => value.push(escaped),
                            None => return Err(malformed("unterminated string")),
                        },
                        Some(other) => value.push(other),
                        None => return Err(malformed("unterminated string")),
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    digits.push(d);
                    chars.next();
                }
                let value = digits
                    .parse()
                    .map_err(|_| malformed(format!("number {} is too large", digits)))?;
                tokens.push(Token::Int(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if !(d.is_alphanumeric() || d == '_' || d == '-') {
                        break;
                    }
                    ident.push(d);
                    chars.next();
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(malformed(format!("unexpected character '{}'", other))),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    source: String,
}

impl Parser {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn expect(&mut self, wanted: Token, what: &str) -> Result<(), ParseError> {
        match self.next() {
            Some(token) if token == wanted => Ok(()),
            _ => Err(malformed(format!("expected {} in '{}'", what, self.source))),
        }
    }

    fn ident(&mut self) -> Result<String, ParseError> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            _ => Err(malformed(format!("expected a name in '{}'", self.source))),
        }
    }

    fn string(&mut self) -> Result<String, ParseError> {
        match self.next() {
            Some(Token::Str(value)) => Ok(value),
            _ => Err(malformed(format!(
                "expected a quoted string in '{}'",
                self.source
            ))),
        }
    }

    fn end(&self) -> Result<(), ParseError> {
        match self.peek() {
            None => Ok(()),
            Some(_) => Err(malformed(format!(
                "unexpected trailing input in '{}'",
                self.source
            ))),
        }
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        match self.next() {
            Some(Token::LParen) => {
                self.expect(Token::Dot, "'.'")?;
                let target = match self.ident()?.as_str() {
                    "Container" => Target::Named(self.string()?),
                    "ContainerWithLabel" => Target::Labelled {
                        key: self.string()?,
                        value: self.string()?,
                    },
                    other => return Err(ParseError::Unknown(other.to_string())),
                };
                self.expect(Token::RParen, "')'")?;
                self.expect(Token::Dot, "'.'")?;
                let accessor = self.accessor()?;
                self.end()?;
                Ok(Expr::Container { target, accessor })
            }
            Some(Token::Dot) => {
                let name = self.ident()?;
                match name.as_str() {
                    "ExternalAddress" => {
                        self.end()?;
                        Ok(Expr::ExternalAddress)
                    }
                    "Self" => {
                        self.expect(Token::Dot, "'.'")?;
                        let accessor = self.accessor()?;
                        self.end()?;
                        Ok(Expr::Container {
                            target: Target::Current,
                            accessor,
                        })
                    }
                    _ => {
                        self.end()?;
                        Ok(Expr::Field(name))
                    }
                }
            }
            _ => Err(malformed(format!(
                "placeholder '{}' must start with '.' or '('",
                self.source
            ))),
        }
    }

    fn accessor(&mut self) -> Result<Accessor, ParseError> {
        match self.ident()?.as_str() {
            "ExposedPort" => match self.next() {
                Some(Token::Int(port)) => u16::try_from(port)
                    .ok()
                    .filter(|p| *p > 0)
                    .map(Accessor::ExposedPort)
                    .ok_or_else(|| malformed(format!("invalid port {}", port))),
                _ => Err(malformed(format!(
                    "ExposedPort needs a port number in '{}'",
                    self.source
                ))),
            },
            "Hostname" => Ok(Accessor::Hostname),
            "Name" => Ok(Accessor::Name),
            "GetLabel" => Ok(Accessor::GetLabel(self.string()?)),
            other => Err(ParseError::Unknown(other.to_string())),
        }
    }
}

/// Parse one placeholder body (the text between `{{` and `}}`)
pub fn parse_expr(source: &str) -> Result<Expr, ParseError> {
    let source = source.trim();
    let mut parser = Parser {
        tokens: lex(source)?,
        pos: 0,
        source: source.to_string(),
    };
    parser.expr()
}

/// Split `input` into literal text and placeholders
pub fn parse(input: &str) -> Result<Vec<Segment>, ParseError> {
    let mut segments = Vec::new();
    let mut rest = input;

    while let Some(start) = rest.find(OPEN) {
        if start > 0 {
            segments.push(Segment::Text(rest[..start].to_string()));
        }

        let body_start = start + OPEN.len();
        let end = rest[body_start..]
            .find(CLOSE)
            .ok_or_else(|| malformed("unterminated '{{'"))?;
        let source = &rest[body_start..body_start + end];

        segments.push(Segment::Placeholder {
            source: source.trim().to_string(),
            expr: parse_expr(source)?,
        });
        rest = &rest[body_start + end + CLOSE.len()..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Text(rest.to_string()));
    }
    Ok(segments)
}

/// Whether `input` contains placeholder syntax at all
pub fn has_placeholders(input: &str) -> bool {
    input.contains(OPEN)
}
