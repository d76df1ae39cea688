//! Drives the language server through its `LanguageServer` methods

use std::sync::Arc;

use redmatch_core::{SourceFormat, load_schema};
use redmatch_lsp::{MemorySchemaSource, RedmatchLanguageServer, ServerOptions};
use tower_lsp::lsp_types::*;
use tower_lsp::{LanguageServer, LspService};

const EXPORT: &str = r#"[
    {"field_name": "record_id", "field_type": "text", "field_label": "Record ID"},
    {"field_name": "pat_dob", "field_type": "text", "field_label": "Date of birth",
     "text_validation_type_or_show_slider_number": "date_ymd"},
    {"field_name": "pat_sex", "field_type": "radio", "field_label": "Sex",
     "select_choices_or_calculations": "1, Male | 2, Female"}
]"#;

fn options() -> ServerOptions {
    let schema = load_schema(EXPORT, SourceFormat::Json).unwrap();
    ServerOptions {
        schemas: Arc::new(MemorySchemaSource::new().with_schema("study.json", schema)),
        terminology: None,
    }
}

fn uri() -> Url {
    Url::parse("file:///study/rules.rdm").unwrap()
}

async fn open(server: &RedmatchLanguageServer, text: &str) {
    server
        .did_open(DidOpenTextDocumentParams {
            text_document: TextDocumentItem::new(uri(), "redmatch".to_string(), 1, text.to_string()),
        })
        .await;
}

async fn complete(server: &RedmatchLanguageServer, line: u32, character: u32) -> Vec<String> {
    let response = server
        .completion(CompletionParams {
            text_document_position: TextDocumentPositionParams::new(
                TextDocumentIdentifier::new(uri()),
                Position::new(line, character),
            ),
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
            context: None,
        })
        .await
        .unwrap();
    match response {
        Some(CompletionResponse::Array(items)) => items.into_iter().map(|i| i.label).collect(),
        _ => Vec::new(),
    }
}

#[tokio::test]
async fn test_initialize_advertises_capabilities() {
    let (service, _socket) =
        LspService::new(|client| RedmatchLanguageServer::with_options(client, options()));
    let result = service
        .inner()
        .initialize(InitializeParams::default())
        .await
        .unwrap();

    assert_eq!(result.server_info.unwrap().name, "redmatch-lsp");
    let completion = result.capabilities.completion_provider.unwrap();
    assert_eq!(completion.trigger_characters, Some(vec!["(".to_string()]));
}

#[tokio::test]
async fn test_open_change_and_complete() {
    let (service, _socket) =
        LspService::new(|client| RedmatchLanguageServer::with_options(client, options()));
    let server = service.inner();

    open(server, "SCHEMA: 'study.json' (REDCAP)\nRULES: {\n  VALUE(").await;
    let analysis = server
        .sessions()
        .analysis(uri().as_str())
        .await
        .unwrap();
    assert!(!analysis.diagnostics.is_empty());
    assert_eq!(complete(server, 2, 8).await.len(), 5);

    server
        .did_change(DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier::new(uri(), 2),
            content_changes: vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: "SCHEMA: 'study.json' (REDCAP)\nRULES: {\n  VALUE(pat_s".to_string(),
            }],
        })
        .await;
    assert_eq!(
        complete(server, 2, 13).await,
        vec!["pat_sex", "pat_sex___1", "pat_sex___2"]
    );
}

#[tokio::test]
async fn test_valid_document_has_no_diagnostics() {
    let (service, _socket) =
        LspService::new(|client| RedmatchLanguageServer::with_options(client, options()));
    let server = service.inner();

    open(
        server,
        "SCHEMA: 'study.json' (REDCAP)
RULES: {
  NOTNULL(pat_dob) { Patient<p>: * birthDate = VALUE(pat_dob) }
}",
    )
    .await;
    let analysis = server
        .sessions()
        .analysis(uri().as_str())
        .await
        .unwrap();
    assert!(analysis.diagnostics.is_empty(), "{:#?}", analysis.diagnostics);
}

#[tokio::test]
async fn test_close_forgets_document() {
    let (service, _socket) =
        LspService::new(|client| RedmatchLanguageServer::with_options(client, options()));
    let server = service.inner();

    open(server, "SCHEMA: 'study.json' (REDCAP)\nRULES: {}").await;
    assert_eq!(server.sessions().len(), 1);

    server
        .did_close(DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier::new(uri()),
        })
        .await;
    assert!(server.sessions().is_empty());
    assert!(complete(server, 0, 0).await.is_empty());
}
