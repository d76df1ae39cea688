//! Redmatch Language Server Protocol (LSP)
//!
//! Provides IDE support for Redmatch rules documents:
//! - Diagnostics (syntax, schema resolution, terminology)
//! - Field completion inside `VALUE(`, `NULL(`, `NOTNULL(`, `CONCEPT(`,
//!   `CONCEPT_SELECTED(` and `CODE_SELECTED(`
//!
//! State lives in a [`SessionStore`] owned by the server for one connection.

pub mod completion;
pub mod diagnostics;
pub mod server;
pub mod session;

pub use completion::completions;
pub use server::{RedmatchLanguageServer, ServerOptions};
pub use session::{
    Analysis, DocumentEntry, DocumentId, FsSchemaSource, Installed, MemorySchemaSource,
    SchemaSource, SessionStore,
};

use tower_lsp::{LspService, Server};

/// Serve one editor connection over stdin/stdout until it shuts down
pub async fn serve_stdio(options: ServerOptions) {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (service, socket) =
        LspService::new(|client| RedmatchLanguageServer::with_options(client, options));
    Server::new(stdin, stdout, socket).serve(service).await;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
