//! Lexer for Redmatch rules documents
//!
//! Trivia (whitespace, newlines, comments) is kept in the token stream so
//! that the completion engine can re-tokenize a single line and still see
//! exactly what the user typed. The parser filters it out.

use std::ops::Range;

/// Simple span representing a byte range in the source
pub type Span = Range<usize>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    // Section keywords
    SchemaKw,
    TargetKw,
    ServerKw,
    AliasesKw,
    RulesKw,
    MappingsKw,
    RedcapKw,
    DbKw,

    // Rule keywords
    ElseKw,
    RepeatKw,
    TrueKw,
    FalseKw,
    NullKw,
    NotNullKw,
    ValueKw,
    RefKw,
    CodeKw,
    ConceptKw,
    ConceptSelectedKw,
    CodeSelectedKw,

    // Literals and names
    Ident,
    Alias,
    Url,
    Code,
    String,
    Number,

    // Punctuation
    Colon,
    Comma,
    Semicolon,
    Dot,
    DotDot,
    Star,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Neq,
    Caret,
    Amp,
    Pipe,
    Arrow,

    // Trivia
    Whitespace,
    Newline,
    CommentLine,
    CommentBlock,

    Error,
    Eof,
}

impl TokenKind {
    pub fn is_trivia(&self) -> bool {
        matches!(
            self,
            TokenKind::Whitespace
                | TokenKind::Newline
                | TokenKind::CommentLine
                | TokenKind::CommentBlock
        )
    }

    /// Keywords that open a top-level section
    pub fn is_section_keyword(&self) -> bool {
        matches!(
            self,
            TokenKind::SchemaKw
                | TokenKind::TargetKw
                | TokenKind::ServerKw
                | TokenKind::AliasesKw
                | TokenKind::RulesKw
                | TokenKind::MappingsKw
        )
    }

    /// Keywords whose parenthesized argument is a field id
    pub fn takes_field_argument(&self) -> bool {
        matches!(
            self,
            TokenKind::NullKw
                | TokenKind::NotNullKw
                | TokenKind::ValueKw
                | TokenKind::ConceptKw
                | TokenKind::ConceptSelectedKw
                | TokenKind::CodeSelectedKw
        )
    }

    /// Human readable description used in parser messages
    pub fn describe(&self) -> &'static str {
        match self {
            TokenKind::SchemaKw => "'SCHEMA'",
            TokenKind::TargetKw => "'TARGET'",
            TokenKind::ServerKw => "'SERVER'",
            TokenKind::AliasesKw => "'ALIASES'",
            TokenKind::RulesKw => "'RULES'",
            TokenKind::MappingsKw => "'MAPPINGS'",
            TokenKind::RedcapKw => "'REDCAP'",
            TokenKind::DbKw => "'DB'",
            TokenKind::ElseKw => "'ELSE'",
            TokenKind::RepeatKw => "'REPEAT'",
            TokenKind::TrueKw => "'TRUE'",
            TokenKind::FalseKw => "'FALSE'",
            TokenKind::NullKw => "'NULL'",
            TokenKind::NotNullKw => "'NOTNULL'",
            TokenKind::ValueKw => "'VALUE'",
            TokenKind::RefKw => "'REF'",
            TokenKind::CodeKw => "'CODE'",
            TokenKind::ConceptKw => "'CONCEPT'",
            TokenKind::ConceptSelectedKw => "'CONCEPT_SELECTED'",
            TokenKind::CodeSelectedKw => "'CODE_SELECTED'",
            TokenKind::Ident => "identifier",
            TokenKind::Alias => "alias",
            TokenKind::Url => "URL",
            TokenKind::Code => "code",
            TokenKind::String => "string",
            TokenKind::Number => "number",
            TokenKind::Colon => "':'",
            TokenKind::Comma => "','",
            TokenKind::Semicolon => "';'",
            TokenKind::Dot => "'.'",
            TokenKind::DotDot => "'..'",
            TokenKind::Star => "'*'",
            TokenKind::LParen => "'('",
            TokenKind::RParen => "')'",
            TokenKind::LBrace => "'{'",
            TokenKind::RBrace => "'}'",
            TokenKind::LBracket => "'['",
            TokenKind::RBracket => "']'",
            TokenKind::Lt => "'<'",
            TokenKind::Gt => "'>'",
            TokenKind::Le => "'<='",
            TokenKind::Ge => "'>='",
            TokenKind::Eq => "'='",
            TokenKind::Neq => "'!='",
            TokenKind::Caret => "'^'",
            TokenKind::Amp => "'&'",
            TokenKind::Pipe => "'|'",
            TokenKind::Arrow => "'->'",
            TokenKind::Whitespace => "whitespace",
            TokenKind::Newline => "newline",
            TokenKind::CommentLine | TokenKind::CommentBlock => "comment",
            TokenKind::Error => "invalid input",
            TokenKind::Eof => "end of file",
        }
    }
}

/// A lexer error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexerError {
    pub message: String,
    pub span: Span,
}

impl LexerError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

/// A token with its kind and span
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, span: Span) -> Self {
        Self {
            kind,
            text: text.into(),
            span,
        }
    }
}

/// Result returned by the lexer
pub type LexResult = (Vec<Token>, Vec<LexerError>);

/// Tokenize `input`, keeping trivia. The last token is always `Eof`.
pub fn lex(input: &str) -> LexResult {
    let mut tokens: Vec<Token> = Vec::new();
    let mut errors = Vec::new();

    let len = input.len();
    let mut i = 0usize;

    while i < len {
        let Some((current, size)) = next_char(input, i) else {
            break;
        };
        let start = i;

        // Codes follow `system|` in a concept literal, or open a CODE(...) call
        if in_code_position(&tokens) && !current.is_whitespace() && current != '\'' {
            let end = scan_while(input, start, |c| {
                !c.is_whitespace() && !matches!(c, '|' | ')' | ',' | ';' | '\'' | '}')
            });
            if end > start {
                tokens.push(Token::new(TokenKind::Code, &input[start..end], span(start, end)));
                i = end;
                continue;
            }
        }

        match current {
            '\n' => {
                tokens.push(Token::new(TokenKind::Newline, "\n", span(start, i + size)));
                i += size;
            }
            '\r' => {
                let mut end = i + size;
                if let Some(('\n', nl_size)) = next_char(input, end) {
                    end += nl_size;
                }
                tokens.push(Token::new(TokenKind::Newline, &input[start..end], span(start, end)));
                i = end;
            }
            c if c.is_whitespace() => {
                let end = scan_while(input, start, |c| {
                    c.is_whitespace() && c != '\n' && c != '\r'
                });
                tokens.push(Token::new(TokenKind::Whitespace, &input[start..end], span(start, end)));
                i = end;
            }
            '/' if next_char(input, i + size).map(|(c, _)| c) == Some('/') => {
                let end = scan_while(input, start, |c| c != '\n' && c != '\r');
                tokens.push(Token::new(TokenKind::CommentLine, &input[start..end], span(start, end)));
                i = end;
            }
            '/' if next_char(input, i + size).map(|(c, _)| c) == Some('*') => {
                let (end, terminated) = match input[start + 2..].find("*/") {
                    Some(pos) => (start + 2 + pos + 2, true),
                    None => (len, false),
                };
                if !terminated {
                    errors.push(LexerError::new("Unterminated block comment", span(start, end)));
                }
                tokens.push(Token::new(TokenKind::CommentBlock, &input[start..end], span(start, end)));
                i = end;
            }
            '\'' => {
                let (end, error) = lex_string(input, start);
                if let Some(err) = error {
                    errors.push(err);
                }
                tokens.push(Token::new(TokenKind::String, &input[start..end], span(start, end)));
                i = end;
            }
            '$' if next_char(input, i + size).map(|(c, _)| c) == Some('{') => {
                let end = lex_ident(input, start);
                tokens.push(Token::new(TokenKind::Ident, &input[start..end], span(start, end)));
                i = end;
            }
            '$' => {
                let end = scan_while(input, i + size, |c| c.is_ascii_alphanumeric() || c == '_');
                if end == i + size {
                    errors.push(LexerError::new("Expected alias name after '$'", span(start, end)));
                    tokens.push(Token::new(TokenKind::Error, "$", span(start, end)));
                } else {
                    tokens.push(Token::new(TokenKind::Alias, &input[start..end], span(start, end)));
                }
                i = end;
            }
            c if c.is_ascii_digit() => {
                let end = lex_number(input, start);
                tokens.push(Token::new(TokenKind::Number, &input[start..end], span(start, end)));
                i = end;
            }
            '-' if next_char(input, i + size).is_some_and(|(c, _)| c.is_ascii_digit()) => {
                let end = lex_number(input, i + size);
                tokens.push(Token::new(TokenKind::Number, &input[start..end], span(start, end)));
                i = end;
            }
            c if c.is_alphabetic() || c == '_' => {
                if let Some(end) = lex_url(input, start) {
                    tokens.push(Token::new(TokenKind::Url, &input[start..end], span(start, end)));
                    i = end;
                    continue;
                }
                let end = lex_ident(input, start);
                let text = &input[start..end];
                tokens.push(Token::new(keyword_kind(text), text, span(start, end)));
                i = end;
            }
            _ => {
                let (kind, end) = lex_punctuation(input, start);
                if kind == TokenKind::Error {
                    errors.push(LexerError::new(
                        format!("Unexpected character '{}'", current),
                        span(start, end),
                    ));
                }
                tokens.push(Token::new(kind, &input[start..end], span(start, end)));
                i = end;
            }
        }
    }

    tokens.push(Token::new(TokenKind::Eof, "", span(len, len)));
    (tokens, errors)
}

fn keyword_kind(text: &str) -> TokenKind {
    match text {
        "SCHEMA" => TokenKind::SchemaKw,
        "TARGET" => TokenKind::TargetKw,
        "SERVER" => TokenKind::ServerKw,
        "ALIASES" => TokenKind::AliasesKw,
        "RULES" => TokenKind::RulesKw,
        "MAPPINGS" => TokenKind::MappingsKw,
        "REDCAP" => TokenKind::RedcapKw,
        "DB" => TokenKind::DbKw,
        "ELSE" => TokenKind::ElseKw,
        "REPEAT" => TokenKind::RepeatKw,
        "TRUE" => TokenKind::TrueKw,
        "FALSE" => TokenKind::FalseKw,
        "NULL" => TokenKind::NullKw,
        "NOTNULL" => TokenKind::NotNullKw,
        "VALUE" => TokenKind::ValueKw,
        "REF" => TokenKind::RefKw,
        "CODE" => TokenKind::CodeKw,
        "CONCEPT" => TokenKind::ConceptKw,
        "CONCEPT_SELECTED" => TokenKind::ConceptSelectedKw,
        "CODE_SELECTED" => TokenKind::CodeSelectedKw,
        _ => TokenKind::Ident,
    }
}

/// Last two significant tokens are `system |` or `CODE (`
fn in_code_position(tokens: &[Token]) -> bool {
    let mut significant = tokens.iter().rev().filter(|t| !t.kind.is_trivia());
    // Whitespace between `|` and the code ends the code position
    if tokens.last().is_some_and(|t| t.kind.is_trivia()) {
        return false;
    }
    match (significant.next(), significant.next()) {
        (Some(last), Some(before)) => matches!(
            (before.kind, last.kind),
            (TokenKind::Url | TokenKind::Alias, TokenKind::Pipe)
                | (TokenKind::CodeKw, TokenKind::LParen)
        ),
        _ => false,
    }
}

/// Identifier characters, including `${var}` placeholders
fn lex_ident(input: &str, start: usize) -> usize {
    let mut end = start;
    while let Some((c, size)) = next_char(input, end) {
        if c == '$' && next_char(input, end + size).map(|(n, _)| n) == Some('{') {
            match input[end..].find('}') {
                Some(close) => {
                    end += close + 1;
                    continue;
                }
                None => break,
            }
        }
        let is_arrow = c == '-' && next_char(input, end + size).map(|(n, _)| n) == Some('>');
        if (c.is_alphanumeric() || c == '_' || c == '-') && !is_arrow {
            end += size;
        } else {
            break;
        }
    }
    end
}

/// `scheme://...` or `urn:...` systems
fn lex_url(input: &str, start: usize) -> Option<usize> {
    let scheme_end = scan_while(input, start, |c| c.is_ascii_alphanumeric() || c == '+');
    let rest = &input[scheme_end..];
    let is_url = rest.starts_with("://")
        || (input[start..scheme_end].eq_ignore_ascii_case("urn")
            && rest.starts_with(':')
            && rest[1..].chars().next().is_some_and(|c| !c.is_whitespace()));
    if !is_url {
        return None;
    }
    Some(scan_while(input, scheme_end, |c| {
        !c.is_whitespace() && !matches!(c, '|' | ')' | ',' | ';' | '\'' | '{' | '}')
    }))
}

fn lex_number(input: &str, start: usize) -> usize {
    let mut end = scan_while(input, start, |c| c.is_ascii_digit());
    // A single dot followed by a digit is a decimal point; `..` is a range
    if input[end..].starts_with('.')
        && input[end + 1..].chars().next().is_some_and(|c| c.is_ascii_digit())
    {
        end = scan_while(input, end + 1, |c| c.is_ascii_digit());
    }
    end
}

fn lex_string(input: &str, start: usize) -> (usize, Option<LexerError>) {
    let mut end = start + 1;
    while let Some((c, size)) = next_char(input, end) {
        match c {
            '\\' => {
                end += size;
                if let Some((_, escaped)) = next_char(input, end) {
                    end += escaped;
                }
            }
            '\'' => return (end + size, None),
            '\n' | '\r' => break,
            _ => end += size,
        }
    }
    (
        end,
        Some(LexerError::new("Unterminated string literal", span(start, end))),
    )
}

fn lex_punctuation(input: &str, start: usize) -> (TokenKind, usize) {
    let rest = &input[start..];
    let two = [
        ("..", TokenKind::DotDot),
        ("<=", TokenKind::Le),
        (">=", TokenKind::Ge),
        ("!=", TokenKind::Neq),
        ("->", TokenKind::Arrow),
    ];
    for (text, kind) in two {
        if rest.starts_with(text) {
            return (kind, start + 2);
        }
    }

    let kind = match rest.chars().next() {
        Some(':') => TokenKind::Colon,
        Some(',') => TokenKind::Comma,
        Some(';') => TokenKind::Semicolon,
        Some('.') => TokenKind::Dot,
        Some('*') => TokenKind::Star,
        Some('(') => TokenKind::LParen,
        Some(')') => TokenKind::RParen,
        Some('{') => TokenKind::LBrace,
        Some('}') => TokenKind::RBrace,
        Some('[') => TokenKind::LBracket,
        Some(']') => TokenKind::RBracket,
        Some('<') => TokenKind::Lt,
        Some('>') => TokenKind::Gt,
        Some('=') => TokenKind::Eq,
        Some('^') => TokenKind::Caret,
        Some('&') => TokenKind::Amp,
        Some('|') => TokenKind::Pipe,
        _ => TokenKind::Error,
    };
    let size = rest.chars().next().map(char::len_utf8).unwrap_or(1);
    (kind, start + size)
}

fn scan_while(input: &str, start: usize, predicate: impl Fn(char) -> bool) -> usize {
    let mut end = start;
    while let Some((c, size)) = next_char(input, end) {
        if !predicate(c) {
            break;
        }
        end += size;
    }
    end
}

fn next_char(input: &str, pos: usize) -> Option<(char, usize)> {
    input[pos..].chars().next().map(|c| (c, c.len_utf8()))
}

fn span(start: usize, end: usize) -> Span {
    start..end
}

/// Drop trivia and return the significant tokens (Eof included)
pub fn significant(tokens: Vec<Token>) -> Vec<Token> {
    tokens.into_iter().filter(|t| !t.kind.is_trivia()).collect()
}
