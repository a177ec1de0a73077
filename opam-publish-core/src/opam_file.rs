//! Reading of the three package metadata files: `opam`, `descr` and `url`.
//!
//! The parser understands the opam value syntax (strings, idents, integers, lists, groups,
//! options, operators, sections, `#` and `(* *)` comments) well enough to surface structural
//! warnings and read the handful of fields the tool needs. It keeps the source text and the byte
//! span of every top-level item so fields can be removed without reformatting the rest of the
//! file.

use std::collections::HashSet;
use std::fmt;
use std::ops::Range;

/// Content written when no description is found. Also the sentinel for "unfilled".
pub const DESCR_TEMPLATE: &str = "Short description\n\nLong\ndescription\n";

const KNOWN_FIELDS: &[&str] = &[
    "opam-version",
    "name",
    "version",
    "maintainer",
    "authors",
    "author",
    "homepage",
    "bug-reports",
    "dev-repo",
    "license",
    "doc",
    "tags",
    "build",
    "build-test",
    "build-doc",
    "run-test",
    "install",
    "remove",
    "depends",
    "depopts",
    "conflicts",
    "conflict-class",
    "depexts",
    "messages",
    "post-messages",
    "available",
    "flags",
    "features",
    "libraries",
    "syntax",
    "patches",
    "substs",
    "build-env",
    "setenv",
    "ocaml-version",
    "os",
    "synopsis",
    "description",
    "extra-files",
    "pin-depends",
];

const KNOWN_SECTIONS: &[&str] = &["url", "extra-source"];

const STRING_FIELDS: &[&str] = &["homepage", "bug-reports", "dev-repo", "license"];

/// A syntax error, with the 1-based line it was found on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Ident(String),
    Int(i64),
    Bool(bool),
    Op(String),
    List(Vec<Value>),
    Group(Vec<Value>),
    /// A value followed by a `{ ... }` filter.
    Option(Box<Value>, Vec<Value>),
    /// Several values in a row, e.g. `"foo" & "bar"`.
    Seq(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Strings found in a single string or a list of strings.
    pub fn strings(&self) -> Vec<&str> {
        match self {
            Value::String(s) => vec![s.as_str()],
            Value::List(items) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemKind {
    Field {
        name: String,
        value: Value,
    },
    Section {
        kind: String,
        name: Option<String>,
        items: Vec<Item>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub kind: ItemKind,
    pub span: Range<usize>,
    pub line: usize,
}

/// A parsed `opam` (or `url`) file.
#[derive(Debug, Clone)]
pub struct OpamFile {
    text: String,
    items: Vec<Item>,
}

impl OpamFile {
    pub fn parse(text: &str) -> Result<OpamFile, ParseError> {
        let tokens = tokenize(text)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
        };
        let items = parser.items(false)?;
        Ok(OpamFile {
            text: text.to_string(),
            items,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// First top-level field with the given name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.items.iter().find_map(|item| match &item.kind {
            ItemKind::Field { name: n, value } if n == name => Some(value),
            _ => None,
        })
    }

    pub fn string_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn name(&self) -> Option<&str> {
        self.string_field("name")
    }

    pub fn version(&self) -> Option<&str> {
        self.string_field("version")
    }

    pub fn homepage(&self) -> Option<&str> {
        self.string_field("homepage")
    }

    pub fn bug_reports(&self) -> Option<&str> {
        self.string_field("bug-reports")
    }

    pub fn dev_repo(&self) -> Option<&str> {
        self.string_field("dev-repo")
    }

    /// Structural warnings: missing mandatory fields, duplicates, unknown fields, badly typed
    /// string fields.
    pub fn lint(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.has_field("opam-version") {
            warnings.push("missing field 'opam-version'".to_string());
        }
        if !self.has_field("maintainer") {
            warnings.push("missing field 'maintainer'".to_string());
        }
        let mut seen = HashSet::new();
        for item in &self.items {
            match &item.kind {
                ItemKind::Field { name, value } => {
                    if !seen.insert(name.as_str()) {
                        warnings.push(format!("line {}: duplicate field '{}'", item.line, name));
                    }
                    if !KNOWN_FIELDS.contains(&name.as_str()) && !name.starts_with("x-") {
                        warnings.push(format!("line {}: unknown field '{}'", item.line, name));
                    }
                    if STRING_FIELDS.contains(&name.as_str()) && value.as_str().is_none() {
                        warnings.push(format!(
                            "line {}: field '{}' should be a string",
                            item.line, name
                        ));
                    }
                }
                ItemKind::Section { kind, .. } => {
                    if !KNOWN_SECTIONS.contains(&kind.as_str()) {
                        warnings.push(format!("line {}: unknown section '{}'", item.line, kind));
                    }
                }
            }
        }
        warnings
    }

    /// Source text with the named top-level fields removed; everything else is kept verbatim.
    pub fn without_fields(&self, names: &[&str]) -> String {
        let mut cuts: Vec<Range<usize>> = self
            .items
            .iter()
            .filter(|item| {
                matches!(&item.kind, ItemKind::Field { name, .. } if names.contains(&name.as_str()))
            })
            .map(|item| line_extent(&self.text, item.span.clone()))
            .collect();
        cuts.sort_by_key(|r| r.start);

        let mut out = String::with_capacity(self.text.len());
        let mut pos = 0;
        for cut in cuts {
            if cut.start < pos {
                continue;
            }
            out.push_str(&self.text[pos..cut.start]);
            pos = cut.end;
        }
        out.push_str(&self.text[pos..]);
        out
    }
}

/// Widens a span to whole lines when nothing else shares them.
fn line_extent(text: &str, span: Range<usize>) -> Range<usize> {
    let line_start = text[..span.start].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let line_end = text[span.end..]
        .find('\n')
        .map(|i| span.end + i + 1)
        .unwrap_or(text.len());
    let before_blank = text[line_start..span.start].trim().is_empty();
    let after = text[span.end..line_end].trim();
    if before_blank && (after.is_empty() || after.starts_with('#')) {
        line_start..line_end
    } else {
        span
    }
}

/// The `descr` file: a one-line synopsis followed by a free-form body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descr {
    pub synopsis: String,
    pub body: String,
}

impl Descr {
    pub fn parse(text: &str) -> Descr {
        let (first, rest) = text.split_once('\n').unwrap_or((text, ""));
        let first = first.trim();
        let synopsis = first
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .unwrap_or(first)
            .to_string();
        Descr {
            synopsis,
            body: rest.trim().to_string(),
        }
    }

    pub fn template() -> Descr {
        Descr::parse(DESCR_TEMPLATE)
    }

    pub fn full_text(&self) -> String {
        if self.body.is_empty() {
            self.synopsis.clone()
        } else {
            format!("{}\n\n{}", self.synopsis, self.body)
        }
    }
}

/// True when a description file still holds the template or nothing at all.
pub fn descr_is_unspecified(text: &str) -> bool {
    if text == DESCR_TEMPLATE {
        return true;
    }
    let descr = Descr::parse(text);
    descr.synopsis.trim().is_empty() && descr.body.trim().is_empty()
}

/// Address kinds a `url` file can declare. Only the plain ones are acceptable for publishing.
const URL_FIELDS: &[&str] = &["src", "archive", "http", "git", "darcs", "hg", "local"];

/// The `url` file: primary address, mirrors and checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlFile {
    /// Field the address was declared under (`src`, `archive`, `git`, ...).
    pub kind: String,
    pub address: String,
    pub mirrors: Vec<String>,
    pub checksum: Option<String>,
}

impl UrlFile {
    pub fn parse(text: &str) -> Result<UrlFile, ParseError> {
        let file = OpamFile::parse(text)?;
        let declared: Vec<(&str, &Value, usize)> = file
            .items()
            .iter()
            .filter_map(|item| match &item.kind {
                ItemKind::Field { name, value } if URL_FIELDS.contains(&name.as_str()) => {
                    Some((name.as_str(), value, item.line))
                }
                _ => None,
            })
            .collect();
        let (kind, value, line) = match declared.as_slice() {
            [single] => *single,
            [] => {
                return Err(ParseError {
                    line: 1,
                    message: "no source address declared".to_string(),
                })
            }
            [_, second, ..] => {
                return Err(ParseError {
                    line: second.2,
                    message: "more than one source address declared".to_string(),
                })
            }
        };
        let address = value.as_str().ok_or_else(|| ParseError {
            line,
            message: format!("field '{}' should be a string", kind),
        })?;
        Ok(UrlFile {
            kind: kind.to_string(),
            address: address.to_string(),
            mirrors: file
                .field("mirrors")
                .map(|v| v.strings().into_iter().map(str::to_string).collect())
                .unwrap_or_default(),
            checksum: file.string_field("checksum").map(str::to_string),
        })
    }

    /// Primary address followed by the mirrors.
    pub fn addresses(&self) -> Vec<&str> {
        std::iter::once(self.address.as_str())
            .chain(self.mirrors.iter().map(String::as_str))
            .collect()
    }

    pub fn render(&self) -> String {
        let mut out = format!("{}: \"{}\"\n", self.kind, escape(&self.address));
        if !self.mirrors.is_empty() {
            let mirrors: Vec<String> = self
                .mirrors
                .iter()
                .map(|m| format!("\"{}\"", escape(m)))
                .collect();
            out.push_str(&format!("mirrors: [{}]\n", mirrors.join(" ")));
        }
        if let Some(checksum) = &self.checksum {
            out.push_str(&format!("checksum: \"{}\"\n", escape(checksum)));
        }
        out
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Str(String),
    Ident(String),
    Int(i64),
    Op(String),
    Colon,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    LParen,
    RParen,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    span: Range<usize>,
    line: usize,
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+')
}

fn tokenize(text: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let offset = |i: usize| chars.get(i).map(|(o, _)| *o).unwrap_or(text.len());
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut line = 1;

    while i < chars.len() {
        let (start, c) = chars[i];
        match c {
            '\n' => {
                line += 1;
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '#' => {
                while i < chars.len() && chars[i].1 != '\n' {
                    i += 1;
                }
            }
            '(' if chars.get(i + 1).map(|c| c.1) == Some('*') => {
                let open_line = line;
                let mut depth = 0;
                loop {
                    match (chars.get(i).map(|c| c.1), chars.get(i + 1).map(|c| c.1)) {
                        (Some('('), Some('*')) => {
                            depth += 1;
                            i += 2;
                        }
                        (Some('*'), Some(')')) => {
                            depth -= 1;
                            i += 2;
                            if depth == 0 {
                                break;
                            }
                        }
                        (Some(ch), _) => {
                            if ch == '\n' {
                                line += 1;
                            }
                            i += 1;
                        }
                        (None, _) => {
                            return Err(ParseError {
                                line: open_line,
                                message: "unterminated comment".to_string(),
                            })
                        }
                    }
                }
            }
            '"' => {
                let open_line = line;
                let triple = chars.get(i + 1).map(|c| c.1) == Some('"')
                    && chars.get(i + 2).map(|c| c.1) == Some('"');
                i += if triple { 3 } else { 1 };
                let mut value = String::new();
                loop {
                    let Some(&(_, ch)) = chars.get(i) else {
                        return Err(ParseError {
                            line: open_line,
                            message: "unterminated string".to_string(),
                        });
                    };
                    if ch == '"' {
                        if !triple {
                            i += 1;
                            break;
                        }
                        if chars.get(i + 1).map(|c| c.1) == Some('"')
                            && chars.get(i + 2).map(|c| c.1) == Some('"')
                        {
                            i += 3;
                            break;
                        }
                    }
                    if ch == '\\' {
                        let next = chars.get(i + 1).map(|c| c.1);
                        match next {
                            Some('n') => value.push('\n'),
                            Some('t') => value.push('\t'),
                            Some('r') => value.push('\r'),
                            Some('b') => value.push('\u{8}'),
                            Some('"') => value.push('"'),
                            Some('\\') => value.push('\\'),
                            Some('\n') => {
                                line += 1;
                                i += 2;
                                while chars.get(i).map(|c| c.1 == ' ' || c.1 == '\t')
                                    == Some(true)
                                {
                                    i += 1;
                                }
                                continue;
                            }
                            Some(other) => {
                                value.push('\\');
                                value.push(other);
                            }
                            None => {
                                return Err(ParseError {
                                    line,
                                    message: "unterminated string".to_string(),
                                })
                            }
                        }
                        i += 2;
                        continue;
                    }
                    if ch == '\n' {
                        line += 1;
                    }
                    value.push(ch);
                    i += 1;
                }
                tokens.push(Token {
                    tok: Tok::Str(value),
                    span: start..offset(i),
                    line: open_line,
                });
            }
            '[' | ']' | '{' | '}' | '(' | ')' | ':' => {
                let tok = match c {
                    '[' => Tok::LBracket,
                    ']' => Tok::RBracket,
                    '{' => Tok::LBrace,
                    '}' => Tok::RBrace,
                    '(' => Tok::LParen,
                    ')' => Tok::RParen,
                    _ => Tok::Colon,
                };
                i += 1;
                tokens.push(Token {
                    tok,
                    span: start..offset(i),
                    line,
                });
            }
            c if is_ident_char(c) => {
                let mut j = i;
                while j < chars.len()
                    && (is_ident_char(chars[j].1)
                        || (chars[j].1 == ':'
                            && chars.get(j + 1).map(|c| is_ident_char(c.1)) == Some(true)
                            && j > i))
                {
                    j += 1;
                }
                let word: String = chars[i..j].iter().map(|c| c.1).collect();
                let tok = match word.parse::<i64>() {
                    Ok(n) => Tok::Int(n),
                    Err(_) => Tok::Ident(word),
                };
                tokens.push(Token {
                    tok,
                    span: start..offset(j),
                    line,
                });
                i = j;
            }
            '!' | '=' | '<' | '>' | '&' | '|' | '?' | '%' => {
                let two: String = chars[i..(i + 2).min(chars.len())]
                    .iter()
                    .map(|c| c.1)
                    .collect();
                let len = if matches!(two.as_str(), "!=" | "<=" | ">=" | "+=" | "=+" | "=:") {
                    2
                } else {
                    1
                };
                let op: String = chars[i..i + len].iter().map(|c| c.1).collect();
                i += len;
                tokens.push(Token {
                    tok: Tok::Op(op),
                    span: start..offset(i),
                    line,
                });
            }
            other => {
                return Err(ParseError {
                    line,
                    message: format!("unexpected character {:?}", other),
                })
            }
        }
    }
    Ok(tokens)
}

struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
}

impl<'t> Parser<'t> {
    fn peek(&self, ahead: usize) -> Option<&'t Token> {
        self.tokens.get(self.pos + ahead)
    }

    fn error_here(&self, message: impl Into<String>) -> ParseError {
        let line = self
            .peek(0)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1);
        ParseError {
            line,
            message: message.into(),
        }
    }

    fn items(&mut self, in_section: bool) -> Result<Vec<Item>, ParseError> {
        let mut items = Vec::new();
        loop {
            let Some(token) = self.peek(0) else {
                if in_section {
                    return Err(self.error_here("unterminated section"));
                }
                return Ok(items);
            };
            match &token.tok {
                Tok::RBrace if in_section => return Ok(items),
                Tok::Ident(name) => {
                    let start = token.span.start;
                    let line = token.line;
                    match self.peek(1).map(|t| &t.tok) {
                        Some(Tok::Colon) => {
                            self.pos += 2;
                            let (value, end) = self.field_value()?;
                            items.push(Item {
                                kind: ItemKind::Field {
                                    name: name.clone(),
                                    value,
                                },
                                span: start..end,
                                line,
                            });
                        }
                        Some(Tok::LBrace) | Some(Tok::Str(_)) => {
                            self.pos += 1;
                            let section_name = match self.peek(0).map(|t| &t.tok) {
                                Some(Tok::Str(s)) => {
                                    self.pos += 1;
                                    Some(s.clone())
                                }
                                _ => None,
                            };
                            match self.peek(0).map(|t| &t.tok) {
                                Some(Tok::LBrace) => self.pos += 1,
                                _ => return Err(self.error_here("expected '{'")),
                            }
                            let inner = self.items(true)?;
                            let end = self.peek(0).map(|t| t.span.end).unwrap_or(start);
                            self.pos += 1;
                            items.push(Item {
                                kind: ItemKind::Section {
                                    kind: name.clone(),
                                    name: section_name,
                                    items: inner,
                                },
                                span: start..end,
                                line,
                            });
                        }
                        _ => return Err(self.error_here(format!("expected ':' after '{}'", name))),
                    }
                }
                _ => return Err(self.error_here("expected a field name")),
            }
        }
    }

    fn at_item_start(&self) -> bool {
        match (self.peek(0).map(|t| &t.tok), self.peek(1).map(|t| &t.tok)) {
            (None, _) | (Some(Tok::RBrace), _) => true,
            (Some(Tok::Ident(_)), Some(Tok::Colon)) => true,
            (Some(Tok::Ident(_)), Some(Tok::LBrace)) => true,
            (Some(Tok::Ident(_)), Some(Tok::Str(_))) => {
                matches!(self.peek(2).map(|t| &t.tok), Some(Tok::LBrace))
            }
            _ => false,
        }
    }

    /// Values until the next item starts. Returns the value and its end offset.
    fn field_value(&mut self) -> Result<(Value, usize), ParseError> {
        let mut values = Vec::new();
        let mut end = self.peek(0).map(|t| t.span.start).unwrap_or(0);
        loop {
            if !values.is_empty() && self.at_item_start() {
                break;
            }
            if self.peek(0).is_none() {
                break;
            }
            let (value, value_end) = self.value()?;
            values.push(value);
            end = value_end;
        }
        let value = match values.len() {
            0 => return Err(self.error_here("missing field value")),
            1 => values.remove(0),
            _ => Value::Seq(values),
        };
        Ok((value, end))
    }

    fn value(&mut self) -> Result<(Value, usize), ParseError> {
        let token = self
            .peek(0)
            .ok_or_else(|| self.error_here("unexpected end of file"))?;
        self.pos += 1;
        let (value, mut end) = match &token.tok {
            Tok::Str(s) => (Value::String(s.clone()), token.span.end),
            Tok::Int(n) => (Value::Int(*n), token.span.end),
            Tok::Ident(w) if w == "true" => (Value::Bool(true), token.span.end),
            Tok::Ident(w) if w == "false" => (Value::Bool(false), token.span.end),
            Tok::Ident(w) => (Value::Ident(w.clone()), token.span.end),
            Tok::Op(op) => (Value::Op(op.clone()), token.span.end),
            Tok::LBracket => {
                let (items, end) = self.until(|t| matches!(t, Tok::RBracket), "]")?;
                (Value::List(items), end)
            }
            Tok::LParen => {
                let (items, end) = self.until(|t| matches!(t, Tok::RParen), ")")?;
                (Value::Group(items), end)
            }
            _ => return Err(ParseError {
                line: token.line,
                message: "unexpected token in value".to_string(),
            }),
        };
        let mut value = value;
        if let Some(Tok::LBrace) = self.peek(0).map(|t| &t.tok) {
            self.pos += 1;
            let (filter, filter_end) = self.until(|t| matches!(t, Tok::RBrace), "}")?;
            value = Value::Option(Box::new(value), filter);
            end = filter_end;
        }
        Ok((value, end))
    }

    fn until(
        &mut self,
        close: impl Fn(&Tok) -> bool,
        what: &str,
    ) -> Result<(Vec<Value>, usize), ParseError> {
        let mut items = Vec::new();
        loop {
            match self.peek(0) {
                None => return Err(self.error_here(format!("missing '{}'", what))),
                Some(t) if close(&t.tok) => {
                    self.pos += 1;
                    return Ok((items, t.span.end));
                }
                Some(_) => {
                    let (value, _) = self.value()?;
                    items.push(value);
                }
            }
        }
    }
}
