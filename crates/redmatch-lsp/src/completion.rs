//! Field completion
//!
//! Only the cursor's own line, up to the cursor, is tokenized. When it ends
//! in a field-argument position such as `VALUE(` or `NOTNULL(pat_` the
//! fields of the document's schema are offered in declaration order.

use redmatch_core::Schema;
use redmatch_core::syntax::{LineIndex, TokenKind, lex};
use tower_lsp::lsp_types::{CompletionItem, CompletionItemKind, Position};
use tracing::debug;

use crate::session::SessionStore;

/// Completions at `position` in `text`, using the schema bound to `id`
pub async fn completions(
    store: &SessionStore,
    id: &str,
    text: &str,
    position: Position,
) -> Vec<CompletionItem> {
    let Some(prefix) = field_argument_prefix(text, position) else {
        return Vec::new();
    };
    let Some(schema) = store.schema(id).await else {
        debug!("No schema bound to {}, no completions", id);
        return Vec::new();
    };
    suggest(&schema, &prefix)
}

/// The partial field id typed at `position`, if the cursor is inside a
/// field argument. An empty string means nothing has been typed yet.
///
/// `position.character` counts UTF-16 code units.
pub fn field_argument_prefix(text: &str, position: Position) -> Option<String> {
    let index = LineIndex::new(text);
    let line = position.line as usize;
    let start = index.offset_utf16(line, 0);
    let end = index.offset_utf16(line, position.character as usize);
    let before = &text[start..end];

    let (tokens, _) = lex(before);
    let significant: Vec<_> = tokens
        .iter()
        .filter(|t| !t.kind.is_trivia() && t.kind != TokenKind::Eof)
        .collect();

    match significant.as_slice() {
        [.., keyword, open, ident]
            if keyword.kind.takes_field_argument()
                && open.kind == TokenKind::LParen
                && ident.kind == TokenKind::Ident
                && ident.span.end == before.len() =>
        {
            Some(ident.text.clone())
        }
        [.., keyword, open] if keyword.kind.takes_field_argument() && open.kind == TokenKind::LParen => {
            Some(String::new())
        }
        _ => None,
    }
}

/// Fields whose id starts with `prefix`, ignoring ASCII case
pub fn suggest(schema: &Schema, prefix: &str) -> Vec<CompletionItem> {
    let prefix = prefix.to_ascii_lowercase();
    schema
        .fields()
        .iter()
        .filter(|f| f.id.to_ascii_lowercase().starts_with(&prefix))
        .map(|f| CompletionItem {
            label: f.id.clone(),
            kind: Some(CompletionItemKind::FIELD),
            detail: Some(f.label.clone()),
            ..Default::default()
        })
        .collect()
}
