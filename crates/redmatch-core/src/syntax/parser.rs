//! Recursive-descent parser for rules documents
//!
//! The parser never fails. Problems become diagnostics and the parser skips
//! ahead to the next statement boundary (`,` `*` `}` `;` or a section
//! keyword), so a document that is being edited still yields the rules that
//! are already well formed.
//!
//! `REPEAT(a..b: v)` is expanded here: the rule that follows is parsed once
//! per value with `v` bound, and `${v}` is substituted inside identifiers.

use super::LineIndex;
use super::lexer::{Span, Token, TokenKind, lex, significant};
use crate::ast::*;
use crate::diagnostics::{Diagnostic, DiagnosticCode, Location, normalize};

/// Most values a single `REPEAT` range may expand to
pub const MAX_REPEAT: usize = 1000;

/// Most rules all `REPEAT` clauses of a document may expand to together
pub const MAX_EXPANDED_RULES: usize = 10_000;

/// Deepest nesting of conditions and rules the parser accepts
pub const MAX_NESTING: usize = 128;

/// Output of [`parse`]: a best-effort document plus everything wrong with it
#[derive(Debug, Clone, PartialEq)]
pub struct ParseResult {
    pub document: Document,
    pub diagnostics: Vec<Diagnostic>,
}

/// Parse a rules document
pub fn parse(source: &str) -> ParseResult {
    let index = LineIndex::new(source);
    let (tokens, lex_errors) = lex(source);

    let mut diagnostics: Vec<Diagnostic> = lex_errors
        .iter()
        .map(|e| Diagnostic::error(DiagnosticCode::Lexer, &e.message, index.location(&e.span)))
        .collect();

    // Error tokens were already reported by the lexer
    let tokens: Vec<Token> = significant(tokens)
        .into_iter()
        .filter(|t| t.kind != TokenKind::Error)
        .collect();

    let mut parser = Parser::new(&tokens, &index);
    let document = parser.parse_document();
    diagnostics.extend(parser.diagnostics);
    normalize(&mut diagnostics);

    ParseResult {
        document,
        diagnostics,
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    index: &'a LineIndex<'a>,
    diagnostics: Vec<Diagnostic>,
    /// REPEAT variables in scope, innermost last
    variables: Vec<(String, i64)>,
    /// Current condition and rule nesting
    depth: usize,
    /// Rules produced by REPEAT expansion so far
    expanded: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token], index: &'a LineIndex<'a>) -> Self {
        Self {
            tokens,
            pos: 0,
            index,
            diagnostics: Vec::new(),
            variables: Vec::new(),
            depth: 0,
            expanded: 0,
        }
    }

    /// Run `parse` one nesting level deeper, giving up past [`MAX_NESTING`]
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Option<T>) -> Option<T> {
        if self.depth >= MAX_NESTING {
            self.error_here(format!(
                "Nesting is deeper than the maximum of {MAX_NESTING} levels"
            ));
            return None;
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    // ---- token helpers ----

    fn current(&self) -> &'a Token {
        // The lexer always terminates the stream with Eof
        let tokens = self.tokens;
        &tokens[self.pos.min(tokens.len() - 1)]
    }

    fn kind(&self) -> TokenKind {
        self.current().kind
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.kind() == kind
    }

    fn at_end(&self) -> bool {
        self.at(TokenKind::Eof)
    }

    fn advance(&mut self) -> &'a Token {
        let token = self.current();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Option<&'a Token> {
        if self.at(kind) {
            Some(self.advance())
        } else {
            self.error_here(format!(
                "Expected {}, found {}",
                kind.describe(),
                self.describe_current()
            ));
            None
        }
    }

    fn describe_current(&self) -> String {
        let token = self.current();
        match token.kind {
            TokenKind::Eof => "end of file".to_string(),
            _ => format!("'{}'", token.text),
        }
    }

    /// End offset of the last consumed token
    fn prev_end(&self) -> usize {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map(|t| t.span.end)
            .unwrap_or(0)
    }

    fn location(&self, span: &Span) -> Location {
        self.index.location(span)
    }

    fn location_from(&self, start: usize) -> Location {
        let end = self.prev_end().max(start);
        self.location(&(start..end))
    }

    fn error_here(&mut self, message: impl Into<String>) {
        let location = self.location(&self.current().span);
        self.diagnostics
            .push(Diagnostic::error(DiagnosticCode::Parser, message, location));
    }

    fn error_at(&mut self, code: DiagnosticCode, span: &Span, message: impl Into<String>) {
        let location = self.location(span);
        self.diagnostics.push(Diagnostic::error(code, message, location));
    }

    /// Skip to the next statement boundary without consuming it
    fn recover(&mut self) {
        while !self.at_end() {
            match self.kind() {
                TokenKind::Comma | TokenKind::Star | TokenKind::RBrace | TokenKind::Semicolon => {
                    return;
                }
                kind if kind.is_section_keyword() => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn skip_until(&mut self, stop: impl Fn(TokenKind) -> bool) {
        while !self.at_end() && !stop(self.kind()) && !self.kind().is_section_keyword() {
            self.advance();
        }
    }

    fn recover_to_section(&mut self) {
        self.skip_until(|_| false);
    }

    /// Substitute `${var}` placeholders
    fn expand(&mut self, text: &str, span: &Span) -> String {
        if !text.contains("${") {
            return text.to_string();
        }
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(close) = after.find('}') else {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let name = &after[..close];
            match self.variables.iter().rev().find(|(var, _)| var == name) {
                Some((_, value)) => out.push_str(&value.to_string()),
                None => {
                    self.error_at(
                        DiagnosticCode::UnknownVariable,
                        span,
                        format!("Unknown variable '{name}'"),
                    );
                    out.push_str(&rest[start..start + 2 + close + 1]);
                }
            }
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        out
    }

    // ---- document ----

    fn parse_document(&mut self) -> Document {
        let mut document = Document::default();

        while !self.at_end() {
            let before = self.pos;
            match self.kind() {
                TokenKind::SchemaKw => match self.parse_schema() {
                    Some(decl) if document.schema.is_some() => {
                        self.diagnostics.push(Diagnostic::error(
                            DiagnosticCode::Parser,
                            "Only one SCHEMA declaration is allowed",
                            decl.location,
                        ));
                    }
                    Some(decl) => document.schema = Some(decl),
                    None => self.recover_to_section(),
                },
                TokenKind::TargetKw => match self.parse_string_section() {
                    Some(target) => document.target = Some(target),
                    None => self.recover_to_section(),
                },
                TokenKind::ServerKw => match self.parse_string_section() {
                    Some(server) => document.server = Some(server),
                    None => self.recover_to_section(),
                },
                TokenKind::AliasesKw => self.parse_aliases(&mut document.aliases),
                TokenKind::RulesKw => self.parse_rules(&mut document.rules),
                TokenKind::MappingsKw => {
                    let start = self.current().span.start;
                    self.parse_mappings(&mut document.mappings);
                    document.mappings_location = Some(self.location_from(start));
                }
                _ => {
                    self.error_here(format!(
                        "Expected SCHEMA, TARGET, SERVER, ALIASES, RULES or MAPPINGS, found {}",
                        self.describe_current()
                    ));
                    self.advance();
                    self.recover_to_section();
                }
            }
            if self.pos == before {
                self.advance();
            }
        }

        if document.schema.is_none() {
            self.diagnostics.push(Diagnostic::error(
                DiagnosticCode::MissingSchema,
                "The document does not declare a SCHEMA",
                self.location(&(0..0)),
            ));
        }

        document
    }

    /// `SCHEMA: 'path' (REDCAP | DB)`
    fn parse_schema(&mut self) -> Option<SchemaDecl> {
        let start = self.advance().span.start;
        self.expect(TokenKind::Colon)?;
        let path = self.expect(TokenKind::String)?;
        self.expect(TokenKind::LParen)?;
        let kind = match self.kind() {
            TokenKind::RedcapKw => SchemaKind::Redcap,
            TokenKind::DbKw => SchemaKind::Db,
            _ => {
                self.error_here(format!(
                    "Expected schema type REDCAP or DB, found {}",
                    self.describe_current()
                ));
                return None;
            }
        };
        self.advance();
        self.expect(TokenKind::RParen)?;
        Some(SchemaDecl {
            path: unquote(&path.text),
            kind,
            location: self.location_from(start),
        })
    }

    /// `TARGET: '...'` and `SERVER: '...'`
    fn parse_string_section(&mut self) -> Option<Spanned<String>> {
        self.advance();
        self.expect(TokenKind::Colon)?;
        let value = self.expect(TokenKind::String)?;
        Some(Spanned::new(unquote(&value.text), self.location(&value.span)))
    }

    fn parse_aliases(&mut self, aliases: &mut Vec<Alias>) {
        self.advance();
        if self.expect(TokenKind::Colon).is_none() || self.expect(TokenKind::LBrace).is_none() {
            self.recover_to_section();
            return;
        }

        loop {
            let before = self.pos;
            match self.kind() {
                TokenKind::Alias => {
                    let name = self.advance();
                    let system = self
                        .expect(TokenKind::Colon)
                        .and_then(|_| self.expect(TokenKind::String));
                    match system {
                        Some(system) => aliases.push(Alias {
                            name: name.text.clone(),
                            system: unquote(&system.text),
                            location: self.location(&(name.span.start..system.span.end)),
                        }),
                        None => self.skip_until(|k| matches!(k, TokenKind::Alias | TokenKind::RBrace)),
                    }
                }
                TokenKind::RBrace => {
                    self.advance();
                    return;
                }
                kind if kind == TokenKind::Eof || kind.is_section_keyword() => {
                    self.error_here(format!("Expected '}}', found {}", self.describe_current()));
                    return;
                }
                _ => {
                    self.error_here(format!(
                        "Expected an alias such as $SCT, found {}",
                        self.describe_current()
                    ));
                    self.advance();
                    self.skip_until(|k| matches!(k, TokenKind::Alias | TokenKind::RBrace));
                }
            }
            if self.pos == before {
                self.advance();
            }
        }
    }

    fn parse_rules(&mut self, rules: &mut Vec<Rule>) {
        self.advance();
        if self.expect(TokenKind::Colon).is_none() || self.expect(TokenKind::LBrace).is_none() {
            self.recover_to_section();
            return;
        }

        loop {
            let before = self.pos;
            match self.kind() {
                TokenKind::RBrace => {
                    self.advance();
                    return;
                }
                kind if kind == TokenKind::Eof || kind.is_section_keyword() => {
                    self.error_here(format!("Expected '}}', found {}", self.describe_current()));
                    return;
                }
                kind if starts_rule(kind) => rules.extend(self.parse_rule_group()),
                _ => {
                    self.error_here(format!(
                        "Expected a rule, found {}",
                        self.describe_current()
                    ));
                    self.advance();
                    self.skip_until(|k| starts_rule(k) || k == TokenKind::RBrace);
                }
            }
            if self.pos == before {
                self.advance();
            }
        }
    }

    // ---- rules ----

    /// A rule, or the rules produced by a REPEAT clause
    fn parse_rule_group(&mut self) -> Vec<Rule> {
        if !self.at(TokenKind::RepeatKw) {
            return match self.parse_rule() {
                Some(rule) => vec![rule],
                None => {
                    self.recover();
                    Vec::new()
                }
            };
        }

        let repeat_start = self.current().span.start;
        let Some((variable, from, to)) = self.parse_repeat() else {
            self.recover();
            return Vec::new();
        };

        let count = i128::from(to) - i128::from(from) + 1;
        let problem = if count < 1 {
            Some(format!("REPEAT range {from}..{to} is empty"))
        } else if count > MAX_REPEAT as i128 {
            Some(format!(
                "REPEAT range {from}..{to} has {count} values, the maximum is {MAX_REPEAT}"
            ))
        } else {
            None
        };
        let mut rejected = problem.is_some();
        if let Some(message) = problem {
            self.diagnostics.push(Diagnostic::error(
                DiagnosticCode::Parser,
                message,
                self.location_from(repeat_start),
            ));
        }

        // Parse the rule once per value; a rejected range is still parsed
        // once so the parser ends up after it
        let body_start = self.pos;
        let mut end = body_start;
        let mut rules = Vec::new();
        let values = if rejected { from..=from } else { from..=to };
        for (i, value) in values.enumerate() {
            if i > 0 && self.expanded >= MAX_EXPANDED_RULES {
                self.diagnostics.push(Diagnostic::error(
                    DiagnosticCode::Parser,
                    format!("REPEAT expands to more than {MAX_EXPANDED_RULES} rules"),
                    self.location_from(repeat_start),
                ));
                rejected = true;
                break;
            }
            self.expanded += 1;
            self.pos = body_start;
            self.variables.push((variable.clone(), value));
            match self.parse_rule() {
                Some(rule) => rules.push(rule),
                None => self.recover(),
            }
            self.variables.pop();
            end = self.pos;
        }
        self.pos = end;

        if rejected {
            rules.clear();
        }
        rules
    }

    /// `REPEAT(a..b: var)`
    fn parse_repeat(&mut self) -> Option<(String, i64, i64)> {
        self.advance();
        self.expect(TokenKind::LParen)?;
        let from = self.parse_integer()?;
        self.expect(TokenKind::DotDot)?;
        let to = self.parse_integer()?;
        self.expect(TokenKind::Colon)?;
        let variable = self.expect(TokenKind::Ident)?;
        self.expect(TokenKind::RParen)?;
        Some((variable.text.clone(), from, to))
    }

    fn parse_integer(&mut self) -> Option<i64> {
        let token = self.expect(TokenKind::Number)?;
        match token.text.parse::<i64>() {
            Ok(value) => Some(value),
            Err(_) => {
                self.error_at(
                    DiagnosticCode::Parser,
                    &token.span,
                    format!("Expected an integer, found '{}'", token.text),
                );
                None
            }
        }
    }

    /// `condition { body } (ELSE { body })?`
    fn parse_rule(&mut self) -> Option<Rule> {
        self.nested(Self::parse_rule_inner)
    }

    fn parse_rule_inner(&mut self) -> Option<Rule> {
        let start = self.current().span.start;
        let condition = self.parse_condition()?;
        self.expect(TokenKind::LBrace)?;
        let body = self.parse_body();
        if !self.eat(TokenKind::RBrace) {
            self.error_here(format!("Expected '}}', found {}", self.describe_current()));
        }

        let mut else_body = None;
        if self.eat(TokenKind::ElseKw) && self.expect(TokenKind::LBrace).is_some() {
            else_body = Some(self.parse_body());
            if !self.eat(TokenKind::RBrace) {
                self.error_here(format!("Expected '}}', found {}", self.describe_current()));
            }
        }

        Some(Rule {
            condition,
            body,
            else_body,
            location: self.location_from(start),
        })
    }

    fn parse_body(&mut self) -> Body {
        let mut items = Vec::new();
        loop {
            let before = self.pos;
            match self.kind() {
                TokenKind::RBrace | TokenKind::Eof => break,
                kind if kind.is_section_keyword() => break,
                TokenKind::Ident => match self.parse_resource() {
                    Some(resource) => items.push(BodyItem::Resource(resource)),
                    None => self.recover(),
                },
                kind if starts_rule(kind) => {
                    items.extend(self.parse_rule_group().into_iter().map(BodyItem::Rule));
                }
                _ => {
                    self.error_here(format!(
                        "Expected a resource or a rule, found {}",
                        self.describe_current()
                    ));
                    self.advance();
                    self.recover();
                }
            }
            if self.pos == before {
                self.advance();
            }
        }
        Body { items }
    }

    // ---- conditions ----

    fn parse_condition(&mut self) -> Option<Condition> {
        let mut left = self.parse_and()?;
        while self.eat(TokenKind::Pipe) {
            let right = self.parse_and()?;
            left = Condition::Or(Box::new(left), Box::new(right));
        }
        Some(left)
    }

    fn parse_and(&mut self) -> Option<Condition> {
        let mut left = self.parse_unary()?;
        while self.eat(TokenKind::Amp) {
            let right = self.parse_unary()?;
            left = Condition::And(Box::new(left), Box::new(right));
        }
        Some(left)
    }

    fn parse_unary(&mut self) -> Option<Condition> {
        self.nested(Self::parse_unary_inner)
    }

    fn parse_unary_inner(&mut self) -> Option<Condition> {
        let start = self.current().span.start;
        match self.kind() {
            TokenKind::Caret => {
                self.advance();
                let inner = self.parse_unary()?;
                Some(Condition::Not(Box::new(inner)))
            }
            TokenKind::TrueKw | TokenKind::FalseKw => {
                let token = self.advance();
                Some(Condition::Bool {
                    value: token.kind == TokenKind::TrueKw,
                    location: self.location(&token.span),
                })
            }
            TokenKind::NullKw | TokenKind::NotNullKw => {
                let negated = self.advance().kind == TokenKind::NotNullKw;
                let field = self.parse_field_argument()?;
                Some(if negated {
                    Condition::NotNull(field)
                } else {
                    Condition::Null(field)
                })
            }
            TokenKind::ValueKw => {
                self.advance();
                let field = self.parse_field_argument()?;
                let op = match self.kind() {
                    TokenKind::Eq => CompareOp::Eq,
                    TokenKind::Neq => CompareOp::Neq,
                    TokenKind::Lt => CompareOp::Lt,
                    TokenKind::Gt => CompareOp::Gt,
                    TokenKind::Le => CompareOp::Le,
                    TokenKind::Ge => CompareOp::Ge,
                    _ => {
                        self.error_here(format!(
                            "Expected a comparison operator, found {}",
                            self.describe_current()
                        ));
                        return None;
                    }
                };
                self.advance();
                let literal = match self.kind() {
                    TokenKind::String => Literal::String(unquote(&self.advance().text)),
                    TokenKind::Number => {
                        let token = self.advance();
                        match token.text.parse::<f64>() {
                            Ok(n) => Literal::Number(n),
                            Err(_) => {
                                self.error_at(
                                    DiagnosticCode::Parser,
                                    &token.span,
                                    format!("Invalid number '{}'", token.text),
                                );
                                return None;
                            }
                        }
                    }
                    _ => {
                        self.error_here(format!(
                            "Expected a string or a number, found {}",
                            self.describe_current()
                        ));
                        return None;
                    }
                };
                Some(Condition::Compare {
                    field,
                    op,
                    literal,
                    location: self.location_from(start),
                })
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_condition()?;
                self.expect(TokenKind::RParen)?;
                Some(inner)
            }
            _ => {
                self.error_here(format!(
                    "Expected a condition, found {}",
                    self.describe_current()
                ));
                None
            }
        }
    }

    /// `( field_id )`
    fn parse_field_argument(&mut self) -> Option<FieldRef> {
        self.expect(TokenKind::LParen)?;
        let field = self.parse_field_ref()?;
        self.expect(TokenKind::RParen)?;
        Some(field)
    }

    fn parse_field_ref(&mut self) -> Option<FieldRef> {
        if !self.at(TokenKind::Ident) {
            self.error_here(format!(
                "Expected a field id, found {}",
                self.describe_current()
            ));
            return None;
        }
        let token = self.advance();
        let id = self.expand(&token.text, &token.span);
        Some(FieldRef {
            id,
            location: self.location(&token.span),
        })
    }

    // ---- resources ----

    /// `Type<id>: * path = value (, * path = value)*`
    fn parse_resource(&mut self) -> Option<Resource> {
        let type_token = self.advance();
        let start = type_token.span.start;
        self.expect(TokenKind::Lt)?;
        let (id, id_span) = self.parse_resource_id()?;
        self.expect(TokenKind::Gt)?;
        self.expect(TokenKind::Colon)?;

        let mut attributes = Vec::new();
        loop {
            if self.expect(TokenKind::Star).is_none() {
                break;
            }
            match self.parse_attribute() {
                Some(binding) => attributes.push(binding),
                None => self.recover(),
            }
            if self.eat(TokenKind::Comma) || self.at(TokenKind::Star) {
                continue;
            }
            break;
        }

        Some(Resource {
            resource_type: type_token.text.clone(),
            id,
            id_location: self.location(&id_span),
            attributes,
            location: self.location_from(start),
        })
    }

    /// Resource ids may be split across adjacent tokens, e.g. `obs.1`
    fn parse_resource_id(&mut self) -> Option<(String, Span)> {
        let start = self.current().span.start;
        let mut end = start;
        let mut text = String::new();
        while matches!(
            self.kind(),
            TokenKind::Ident | TokenKind::Number | TokenKind::Dot
        ) && (text.is_empty() || self.current().span.start == end)
        {
            let token = self.advance();
            text.push_str(&token.text);
            end = token.span.end;
        }
        if text.is_empty() {
            self.error_here(format!(
                "Expected a resource id, found {}",
                self.describe_current()
            ));
            return None;
        }
        let span = start..end;
        Some((self.expand(&text, &span), span))
    }

    /// `name([index])?(.name([index])?)* = value`
    fn parse_attribute(&mut self) -> Option<AttributeBinding> {
        let start = self.current().span.start;
        let mut path = Vec::new();
        loop {
            let name = self.expect(TokenKind::Ident)?;
            let index = if self.eat(TokenKind::LBracket) {
                let index = self.parse_index()?;
                self.expect(TokenKind::RBracket)?;
                Some(index)
            } else {
                None
            };
            path.push(PathSegment {
                name: self.expand(&name.text, &name.span),
                index,
            });
            if !self.eat(TokenKind::Dot) {
                break;
            }
        }
        let path_location = self.location_from(start);

        self.expect(TokenKind::Eq)?;
        let value_start = self.current().span.start;
        let value = self.parse_value()?;

        Some(AttributeBinding {
            path,
            value,
            path_location,
            value_location: self.location_from(value_start),
        })
    }

    fn parse_index(&mut self) -> Option<usize> {
        let token = self.current();
        let text = match token.kind {
            TokenKind::Number | TokenKind::Ident => {
                self.advance();
                self.expand(&token.text, &token.span)
            }
            _ => {
                self.error_here(format!(
                    "Expected an index, found {}",
                    self.describe_current()
                ));
                return None;
            }
        };
        match text.parse::<usize>() {
            Ok(index) if index <= MAX_ATTRIBUTE_INDEX => Some(index),
            Ok(index) => {
                self.error_at(
                    DiagnosticCode::Parser,
                    &token.span,
                    format!("Index {index} is larger than the maximum of {MAX_ATTRIBUTE_INDEX}"),
                );
                None
            }
            Err(_) => {
                self.error_at(
                    DiagnosticCode::Parser,
                    &token.span,
                    format!("Invalid index '{text}'"),
                );
                None
            }
        }
    }

    // ---- values ----

    fn parse_value(&mut self) -> Option<Value> {
        match self.kind() {
            TokenKind::TrueKw => {
                self.advance();
                Some(Value::Boolean(true))
            }
            TokenKind::FalseKw => {
                self.advance();
                Some(Value::Boolean(false))
            }
            TokenKind::String => Some(Value::String(unquote(&self.advance().text))),
            TokenKind::Number => {
                let token = self.advance();
                let value = if token.text.contains('.') {
                    token.text.parse::<f64>().ok().map(Value::Decimal)
                } else {
                    token.text.parse::<i64>().ok().map(Value::Integer)
                };
                if value.is_none() {
                    self.error_at(
                        DiagnosticCode::Parser,
                        &token.span,
                        format!("Invalid number '{}'", token.text),
                    );
                }
                value
            }
            TokenKind::RefKw => {
                let start = self.advance().span.start;
                self.expect(TokenKind::LParen)?;
                let resource_type = self.expect(TokenKind::Ident)?;
                self.expect(TokenKind::Lt)?;
                let (id, _) = self.parse_resource_id()?;
                self.expect(TokenKind::Gt)?;
                self.expect(TokenKind::RParen)?;
                Some(Value::Reference(ResourceRef {
                    resource_type: resource_type.text.clone(),
                    id,
                    location: self.location_from(start),
                }))
            }
            TokenKind::Url | TokenKind::Alias => self.parse_concept_literal().map(Value::Concept),
            TokenKind::CodeKw => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let code = self.expect(TokenKind::Code)?;
                self.expect(TokenKind::RParen)?;
                Some(Value::Code(code.text.clone()))
            }
            TokenKind::ValueKw => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let field = self.parse_field_ref()?;
                let mut precision = None;
                if self.eat(TokenKind::Comma) {
                    let token = self.expect(TokenKind::String)?;
                    let text = unquote(&token.text);
                    match text.parse::<DatePrecision>() {
                        Ok(p) => precision = Some(p),
                        Err(_) => self.error_at(
                            DiagnosticCode::InvalidDatePrecision,
                            &token.span,
                            format!(
                                "Invalid date precision '{text}'. Valid values are YEAR, MONTH, DAY, HOUR, MINUTE and SECOND"
                            ),
                        ),
                    }
                }
                self.expect(TokenKind::RParen)?;
                Some(Value::Field(FieldValue {
                    kind: FieldValueKind::Value,
                    field,
                    precision,
                }))
            }
            TokenKind::ConceptKw | TokenKind::ConceptSelectedKw | TokenKind::CodeSelectedKw => {
                let kind = match self.advance().kind {
                    TokenKind::ConceptKw => FieldValueKind::Concept,
                    TokenKind::ConceptSelectedKw => FieldValueKind::ConceptSelected,
                    _ => FieldValueKind::CodeSelected,
                };
                let field = self.parse_field_argument()?;
                Some(Value::Field(FieldValue {
                    kind,
                    field,
                    precision: None,
                }))
            }
            _ => {
                self.error_here(format!(
                    "Expected a value, found {}",
                    self.describe_current()
                ));
                None
            }
        }
    }

    /// `(url | $ALIAS) '|' code ('|' 'display')?`
    fn parse_concept_literal(&mut self) -> Option<ConceptLiteral> {
        let system_token = self.advance();
        let start = system_token.span.start;
        let system = match system_token.kind {
            TokenKind::Alias => SystemRef::Alias(system_token.text.clone()),
            _ => SystemRef::Url(system_token.text.clone()),
        };
        self.expect(TokenKind::Pipe)?;
        let code = match self.kind() {
            TokenKind::Code | TokenKind::Number | TokenKind::Ident => self.advance().text.clone(),
            TokenKind::String => unquote(&self.advance().text),
            _ => {
                self.error_here(format!(
                    "Expected a code, found {}",
                    self.describe_current()
                ));
                return None;
            }
        };
        let display = if self.eat(TokenKind::Pipe) {
            Some(unquote(&self.expect(TokenKind::String)?.text))
        } else {
            None
        };
        Some(ConceptLiteral {
            system,
            code,
            display,
            location: self.location_from(start),
        })
    }

    // ---- mappings ----

    fn parse_mappings(&mut self, mappings: &mut Vec<Mapping>) {
        self.advance();
        if self.expect(TokenKind::Colon).is_none() || self.expect(TokenKind::LBrace).is_none() {
            self.recover_to_section();
            return;
        }

        loop {
            let before = self.pos;
            match self.kind() {
                TokenKind::Ident => match self.parse_mapping() {
                    Some(mapping) => mappings.push(mapping),
                    None => {
                        self.skip_until(|k| matches!(k, TokenKind::Semicolon | TokenKind::RBrace));
                        self.eat(TokenKind::Semicolon);
                    }
                },
                TokenKind::RBrace => {
                    self.advance();
                    return;
                }
                kind if kind == TokenKind::Eof || kind.is_section_keyword() => {
                    self.error_here(format!("Expected '}}', found {}", self.describe_current()));
                    return;
                }
                _ => {
                    self.error_here(format!(
                        "Expected a field mapping, found {}",
                        self.describe_current()
                    ));
                    self.advance();
                    self.skip_until(|k| matches!(k, TokenKind::Semicolon | TokenKind::RBrace));
                    self.eat(TokenKind::Semicolon);
                }
            }
            if self.pos == before {
                self.advance();
            }
        }
    }

    /// `field 'label'? -> concept;`
    fn parse_mapping(&mut self) -> Option<Mapping> {
        let start = self.current().span.start;
        let field = self.parse_field_ref()?;
        let label = if self.at(TokenKind::String) {
            Some(unquote(&self.advance().text))
        } else {
            None
        };
        self.expect(TokenKind::Arrow)?;
        if !matches!(self.kind(), TokenKind::Url | TokenKind::Alias) {
            self.error_here(format!(
                "Expected a concept such as http://snomed.info/sct|123, found {}",
                self.describe_current()
            ));
            return None;
        }
        let target = self.parse_concept_literal()?;
        let location = self.location_from(start);
        if !self.eat(TokenKind::Semicolon) {
            self.error_here(format!("Expected ';', found {}", self.describe_current()));
        }
        Some(Mapping {
            field,
            label,
            target,
            location,
        })
    }
}

fn starts_rule(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::RepeatKw
            | TokenKind::Caret
            | TokenKind::TrueKw
            | TokenKind::FalseKw
            | TokenKind::NullKw
            | TokenKind::NotNullKw
            | TokenKind::ValueKw
            | TokenKind::LParen
    )
}

/// Strip the quotes of a string literal and resolve `\` escapes
fn unquote(text: &str) -> String {
    let inner = text.strip_prefix('\'').unwrap_or(text);
    let inner = inner.strip_suffix('\'').unwrap_or(inner);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "SCHEMA: 'schema.json' (REDCAP)\n";

    fn parse_ok(source: &str) -> Document {
        let result = parse(source);
        assert!(
            result.diagnostics.is_empty(),
            "unexpected diagnostics: {:#?}",
            result.diagnostics
        );
        result.document
    }

    fn first_resource(rule: &Rule) -> &Resource {
        rule.body.resources().next().expect("resource")
    }

    #[test]
    fn test_schema_and_sections() {
        let document = parse_ok(
            "SCHEMA: 'study.csv' (REDCAP)\n\
             TARGET: 'hl7.fhir.r4.core#4.0.1'\n\
             SERVER: 'https://r4.ontoserver.csiro.au/fhir'\n\
             ALIASES: { $SCT: 'http://snomed.info/sct' }\n\
             RULES: { }",
        );
        let schema = document.schema.unwrap();
        assert_eq!(schema.path, "study.csv");
        assert_eq!(schema.kind, SchemaKind::Redcap);
        assert_eq!(document.target.unwrap().value, "hl7.fhir.r4.core#4.0.1");
        assert_eq!(document.aliases[0].name, "$SCT");
        assert_eq!(document.aliases[0].system, "http://snomed.info/sct");
    }

    #[test]
    fn test_resource_with_attributes() {
        let document = parse_ok(&format!(
            "{HEADER}RULES: {{\n  TRUE {{ Patient<p-1>: *identifier[0].value = VALUE(record_id), * active = TRUE }}\n}}"
        ));
        let resource = first_resource(&document.rules[0]);
        assert_eq!(resource.resource_type, "Patient");
        assert_eq!(resource.id, "p-1");
        assert_eq!(resource.attributes.len(), 2);

        let first = &resource.attributes[0];
        assert_eq!(first.path_string(), "identifier.value");
        assert_eq!(first.path[0].index, Some(0));
        assert!(matches!(
            &first.value,
            Value::Field(FieldValue { kind: FieldValueKind::Value, field, .. }) if field.id == "record_id"
        ));
        assert_eq!(resource.attributes[1].value, Value::Boolean(true));
    }

    #[test]
    fn test_condition_precedence() {
        let document = parse_ok(&format!(
            "{HEADER}RULES: {{ NULL(a) | NOTNULL(b) & ^VALUE(c) >= 3 {{ }} }}"
        ));
        match &document.rules[0].condition {
            Condition::Or(left, right) => {
                assert!(matches!(**left, Condition::Null(_)));
                match &**right {
                    Condition::And(l, r) => {
                        assert!(matches!(**l, Condition::NotNull(_)));
                        assert!(matches!(
                            &**r,
                            Condition::Not(inner) if matches!(
                                **inner,
                                Condition::Compare { op: CompareOp::Ge, literal: Literal::Number(n), .. } if n == 3.0
                            )
                        ));
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_else_and_nested_rules() {
        let document = parse_ok(&format!(
            "{HEADER}RULES: {{\n\
               VALUE(pat_sex) = 1 {{ Patient<p>: * gender = CODE(male) }}\n\
               ELSE {{ NOTNULL(pat_sex) {{ Patient<p>: * gender = CODE(other) }} }}\n\
             }}"
        ));
        let rule = &document.rules[0];
        assert!(rule.else_body.is_some());
        let nested: Vec<&Rule> = rule.else_body.as_ref().unwrap().rules().collect();
        assert_eq!(nested.len(), 1);
        assert_eq!(
            first_resource(nested[0]).attributes[0].value,
            Value::Code("other".to_string())
        );
    }

    #[test]
    fn test_concept_literals() {
        let document = parse_ok(&format!(
            "{HEADER}ALIASES: {{ $LNC: 'http://loinc.org' }}\n\
             RULES: {{ TRUE {{ Observation<o>: * code = http://loinc.org|8302-2|'Body height', * category = $LNC|LA6|'A \\'b\\'' }} }}"
        ));
        let resource = first_resource(&document.rules[0]);
        match &resource.attributes[0].value {
            Value::Concept(concept) => {
                assert_eq!(concept.system, SystemRef::Url("http://loinc.org".into()));
                assert_eq!(concept.code, "8302-2");
                assert_eq!(concept.display.as_deref(), Some("Body height"));
            }
            other => panic!("unexpected {other:?}"),
        }
        match &resource.attributes[1].value {
            Value::Concept(concept) => {
                assert_eq!(concept.system, SystemRef::Alias("$LNC".into()));
                assert_eq!(concept.display.as_deref(), Some("A 'b'"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_value_with_precision_and_reference() {
        let document = parse_ok(&format!(
            "{HEADER}RULES: {{ TRUE {{ Condition<c>: * onsetDateTime = VALUE(dx_date, 'month'), * subject = REF(Patient<p>) }} }}"
        ));
        let resource = first_resource(&document.rules[0]);
        assert!(matches!(
            &resource.attributes[0].value,
            Value::Field(FieldValue { precision: Some(DatePrecision::Month), .. })
        ));
        assert!(matches!(
            &resource.attributes[1].value,
            Value::Reference(r) if r.key() == "Patient<p>"
        ));
    }

    #[test]
    fn test_invalid_precision_is_reported() {
        let result = parse(&format!(
            "{HEADER}RULES: {{ TRUE {{ Condition<c>: * onsetDateTime = VALUE(dx_date, 'WEEK') }} }}"
        ));
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].code, DiagnosticCode::InvalidDatePrecision);
        let resource = first_resource(&result.document.rules[0]);
        assert_eq!(resource.attributes.len(), 1);
    }

    #[test]
    fn test_repeat_expands_rules() {
        let document = parse_ok(&format!(
            "{HEADER}RULES: {{\n  REPEAT(1..3: n)\n  NOTNULL(dx_${{n}}) {{ Condition<c${{n}}>: * code = CONCEPT(dx_${{n}}) }}\n}}"
        ));
        assert_eq!(document.rules.len(), 3);
        let ids: Vec<String> = document
            .rules
            .iter()
            .map(|r| first_resource(r).id.clone())
            .collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
        assert!(matches!(
            &document.rules[2].condition,
            Condition::NotNull(field) if field.id == "dx_3"
        ));
    }

    #[test]
    fn test_unknown_variable_is_reported() {
        let result = parse(&format!(
            "{HEADER}RULES: {{ NOTNULL(dx_${{m}}) {{ }} }}"
        ));
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].code, DiagnosticCode::UnknownVariable);
    }

    #[test]
    fn test_mappings() {
        let document = parse_ok(&format!(
            "{HEADER}RULES: {{ }}\n\
             MAPPINGS: {{\n\
               pat_sex___1 'Male' -> http://snomed.info/sct|248153007|'Male';\n\
               pat_sex___2 -> http://snomed.info/sct|248152002;\n\
             }}"
        ));
        assert_eq!(document.mappings.len(), 2);
        assert_eq!(document.mappings[0].field.id, "pat_sex___1");
        assert_eq!(document.mappings[0].label.as_deref(), Some("Male"));
        assert_eq!(document.mappings[1].target.code, "248152002");
        assert!(document.mappings_location.is_some());
    }

    #[test]
    fn test_missing_schema() {
        let result = parse("RULES: { }");
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].code, DiagnosticCode::MissingSchema);
    }

    #[test]
    fn test_recovers_after_bad_attribute() {
        let result = parse(&format!(
            "{HEADER}RULES: {{ TRUE {{ Patient<p>: * gender = , * active = TRUE }} }}"
        ));
        assert!(!result.diagnostics.is_empty());
        let resource = first_resource(&result.document.rules[0]);
        assert_eq!(resource.attributes.len(), 1);
        assert_eq!(resource.attributes[0].path_string(), "active");
    }

    #[test]
    fn test_partial_document_keeps_prefix() {
        let result = parse(&format!(
            "{HEADER}RULES: {{\n  TRUE {{ Patient<p>: * active = TRUE }}\n  NOTNULL(pat_dob) {{ Patient<p>: * birthDate = VALUE("
        ));
        assert!(!result.diagnostics.is_empty());
        assert_eq!(result.document.rules.len(), 2);
        assert_eq!(first_resource(&result.document.rules[0]).attributes.len(), 1);
    }

    #[test]
    fn test_garbage_never_panics() {
        for source in ["", "}", "RULES", "RULES: { VALUE(", "SCHEMA: (", "MAPPINGS: { a -> ; }", "$ | '"] {
            let _ = parse(source);
        }
    }

    #[test]
    fn test_parse_is_idempotent() {
        let source = format!(
            "{HEADER}RULES: {{ REPEAT(1..2: i) VALUE(x_${{i}}) = 'a' {{ Observation<o${{i}}>: * valueString = VALUE(x_${{i}}) }} }}"
        );
        assert_eq!(parse(&source), parse(&source));
    }
}
