//! LSP server implementation for Redmatch rules documents
//!
//! Documents are synchronized in full. Each open or change re-analyses the
//! document through the [`SessionStore`] and publishes the diagnostics of
//! the analysis that was installed. Terminology checks, when a validator is
//! configured, run afterwards without holding the document lock.

use std::sync::Arc;

use redmatch_core::syntax::LineIndex;
use redmatch_core::{TerminologyMode, TerminologyValidator, run_terminology_checks};
use tower_lsp::jsonrpc::Result;
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer};
use tracing::{debug, info};

use crate::completion;
use crate::diagnostics::to_lsp;
use crate::session::{Analysis, FsSchemaSource, SchemaSource, SessionStore};

/// Collaborators injected into the server
#[derive(Clone)]
pub struct ServerOptions {
    pub schemas: Arc<dyn SchemaSource>,
    pub terminology: Option<Arc<dyn TerminologyValidator>>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            schemas: Arc::new(FsSchemaSource),
            terminology: None,
        }
    }
}

/// Redmatch Language Server
pub struct RedmatchLanguageServer {
    client: Client,
    sessions: SessionStore,
    terminology: Option<Arc<dyn TerminologyValidator>>,
}

impl RedmatchLanguageServer {
    pub fn new(client: Client) -> Self {
        Self::with_options(client, ServerOptions::default())
    }

    pub fn with_options(client: Client, options: ServerOptions) -> Self {
        Self {
            client,
            sessions: SessionStore::new(options.schemas),
            terminology: options.terminology,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    async fn refresh(&self, uri: Url, text: String) {
        self.sessions.update(uri.as_str(), text).await;
        self.analyze(uri).await;
    }

    async fn analyze(&self, uri: Url) {
        let id = uri.as_str();
        let Some(installed) = self.sessions.analyze(id).await else {
            return;
        };
        self.publish(&uri, &installed.analysis).await;

        let Some(terminology) = &self.terminology else {
            return;
        };
        if installed.terminology_checks.is_empty() {
            return;
        }
        let outcome = run_terminology_checks(
            &installed.terminology_checks,
            terminology.as_ref(),
            TerminologyMode::Interactive,
        )
        .await;
        match outcome {
            Ok(outcome) => {
                if let Some(analysis) = self
                    .sessions
                    .apply_terminology(id, installed.analysis.version, outcome)
                    .await
                {
                    self.publish(&uri, &analysis).await;
                }
            }
            Err(e) => {
                let reported = e.report();
                self.client
                    .show_message(MessageType::ERROR, reported.to_string())
                    .await;
            }
        }
    }

    async fn publish(&self, uri: &Url, analysis: &Analysis) {
        let index = LineIndex::new(&analysis.text);
        let diagnostics = analysis
            .diagnostics
            .iter()
            .map(|d| to_lsp(d, &index))
            .collect();
        debug!(
            "Publishing {} diagnostics for {}",
            analysis.diagnostics.len(),
            uri
        );
        self.client
            .publish_diagnostics(uri.clone(), diagnostics, None)
            .await;
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for RedmatchLanguageServer {
    async fn initialize(&self, _: InitializeParams) -> Result<InitializeResult> {
        Ok(InitializeResult {
            server_info: Some(ServerInfo {
                name: "redmatch-lsp".to_string(),
                version: Some(crate::VERSION.to_string()),
            }),
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Options(
                    TextDocumentSyncOptions {
                        open_close: Some(true),
                        change: Some(TextDocumentSyncKind::FULL),
                        save: Some(TextDocumentSyncSaveOptions::Supported(true)),
                        ..Default::default()
                    },
                )),
                completion_provider: Some(CompletionOptions {
                    trigger_characters: Some(vec!["(".to_string()]),
                    ..Default::default()
                }),
                ..Default::default()
            },
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        info!("Redmatch language server initialized");
        self.client
            .log_message(MessageType::INFO, "Redmatch LSP server initialized")
            .await;
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let document = params.text_document;
        self.refresh(document.uri, document.text).await;
    }

    async fn did_change(&self, mut params: DidChangeTextDocumentParams) {
        // Full sync: the last change carries the whole text
        if let Some(change) = params.content_changes.pop() {
            self.refresh(params.text_document.uri, change.text).await;
        }
    }

    async fn did_save(&self, params: DidSaveTextDocumentParams) {
        let uri = params.text_document.uri;
        self.sessions.invalidate_schema(uri.as_str()).await;
        match params.text {
            Some(text) => self.refresh(uri, text).await,
            None => self.analyze(uri).await,
        }
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri;
        self.sessions.close(uri.as_str());
        self.client.publish_diagnostics(uri, Vec::new(), None).await;
    }

    async fn completion(&self, params: CompletionParams) -> Result<Option<CompletionResponse>> {
        let position = params.text_document_position;
        let id = position.text_document.uri.as_str();
        let Some(text) = self.sessions.text(id).await else {
            return Ok(None);
        };
        let items = completion::completions(&self.sessions, id, &text, position.position).await;
        Ok(Some(CompletionResponse::Array(items)))
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Shutting down, dropping {} open documents", self.sessions.len());
        self.sessions.clear();
        Ok(())
    }
}
