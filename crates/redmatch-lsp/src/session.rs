//! Document sessions for one editor connection
//!
//! Every open document has its own [`RwLock`], so an edit to one document
//! never waits on another. Analysis (parsing, schema loading, resolution)
//! runs without holding the lock and its result is installed only when no
//! newer edit has arrived in the meantime.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use redmatch_core::diagnostics::normalize;
use redmatch_core::schema::import::{format_for_path, importer_for};
use redmatch_core::{
    Diagnostic, DiagnosticCode, Document, RedmatchError, Schema, TerminologyCheck,
    TerminologyOutcome, parse, resolve,
};
use tokio::sync::RwLock;
use tower_lsp::lsp_types::Url;
use tracing::{debug, warn};

/// Identifier of an open document (its URI as sent by the editor)
pub type DocumentId = String;

/// Result of analysing one version of a document
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub version: u64,
    /// Text the analysis was computed from
    pub text: Arc<str>,
    pub document: Document,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Default)]
pub struct DocumentEntry {
    pub text: String,
    pub version: u64,
    /// `SCHEMA:` path the cached schema was loaded for
    pub schema_ref: Option<String>,
    pub schema: Option<Arc<Schema>>,
    pub analysis: Option<Arc<Analysis>>,
}

/// An analysis that was installed, with the terminology questions it left open
#[derive(Debug, Clone)]
pub struct Installed {
    pub analysis: Arc<Analysis>,
    pub terminology_checks: Vec<TerminologyCheck>,
}

/// Loads the schema a document names in its `SCHEMA:` section
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn load(&self, document: &str, reference: &str) -> redmatch_core::Result<Arc<Schema>>;
}

/// Reads schema exports from disk, relative to the document's own file
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSchemaSource;

impl FsSchemaSource {
    pub fn path_for(document: &str, reference: &str) -> PathBuf {
        let reference = Path::new(reference);
        if reference.is_absolute() {
            return reference.to_path_buf();
        }
        let document_path = Url::parse(document)
            .ok()
            .and_then(|url| url.to_file_path().ok())
            .unwrap_or_else(|| PathBuf::from(document));
        match document_path.parent() {
            Some(dir) => dir.join(reference),
            None => reference.to_path_buf(),
        }
    }
}

#[async_trait]
impl SchemaSource for FsSchemaSource {
    async fn load(&self, document: &str, reference: &str) -> redmatch_core::Result<Arc<Schema>> {
        let path = Self::path_for(document, reference);
        let format = format_for_path(&path).ok_or_else(|| {
            RedmatchError::config_error(format!(
                "Cannot tell the export format of '{}' (expected .json or .csv)",
                path.display()
            ))
        })?;
        let source = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| RedmatchError::io_error(&path, e))?;
        let schema = importer_for(format).load_schema(&source)?;
        debug!("Loaded schema {} with {} fields", path.display(), schema.len());
        Ok(Arc::new(schema))
    }
}

/// Schemas registered up front, keyed by their `SCHEMA:` path
#[derive(Debug, Default)]
pub struct MemorySchemaSource {
    schemas: DashMap<String, Arc<Schema>>,
}

impl MemorySchemaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(self, reference: impl Into<String>, schema: Schema) -> Self {
        self.insert(reference, schema);
        self
    }

    pub fn insert(&self, reference: impl Into<String>, schema: Schema) {
        self.schemas.insert(reference.into(), Arc::new(schema));
    }
}

#[async_trait]
impl SchemaSource for MemorySchemaSource {
    async fn load(&self, _document: &str, reference: &str) -> redmatch_core::Result<Arc<Schema>> {
        self.schemas
            .get(reference)
            .map(|schema| Arc::clone(schema.value()))
            .ok_or_else(|| RedmatchError::config_error(format!("Unknown schema '{}'", reference)))
    }
}

/// Open documents of one connection
pub struct SessionStore {
    documents: DashMap<DocumentId, Arc<RwLock<DocumentEntry>>>,
    versions: AtomicU64,
    schemas: Arc<dyn SchemaSource>,
}

impl SessionStore {
    pub fn new(schemas: Arc<dyn SchemaSource>) -> Self {
        Self {
            documents: DashMap::new(),
            versions: AtomicU64::new(0),
            schemas,
        }
    }

    fn entry(&self, id: &str) -> Option<Arc<RwLock<DocumentEntry>>> {
        self.documents.get(id).map(|entry| Arc::clone(entry.value()))
    }

    fn is_current(&self, id: &str, entry: &Arc<RwLock<DocumentEntry>>) -> bool {
        self.documents
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), entry))
    }

    /// Replace the text of a document, opening it if needed. Returns the new version.
    pub async fn update(&self, id: &str, text: String) -> u64 {
        let entry = Arc::clone(&*self.documents.entry(id.to_string()).or_default());
        let mut guard = entry.write().await;
        // Minted under the lock so the last writer always holds the highest version
        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        guard.text = text;
        guard.version = version;
        debug!("Document {} is now at version {}", id, version);
        version
    }

    /// Forget a document. Returns false if it was not open.
    pub fn close(&self, id: &str) -> bool {
        self.documents.remove(id).is_some()
    }

    pub fn clear(&self) {
        self.documents.clear();
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub async fn text(&self, id: &str) -> Option<String> {
        let entry = self.entry(id)?;
        let guard = entry.read().await;
        Some(guard.text.clone())
    }

    pub async fn version(&self, id: &str) -> Option<u64> {
        let entry = self.entry(id)?;
        let guard = entry.read().await;
        Some(guard.version)
    }

    pub async fn schema(&self, id: &str) -> Option<Arc<Schema>> {
        let entry = self.entry(id)?;
        let guard = entry.read().await;
        guard.schema.clone()
    }

    pub async fn analysis(&self, id: &str) -> Option<Arc<Analysis>> {
        let entry = self.entry(id)?;
        let guard = entry.read().await;
        guard.analysis.clone()
    }

    /// Drop the cached schema so the next analysis loads it again
    pub async fn invalidate_schema(&self, id: &str) {
        if let Some(entry) = self.entry(id) {
            let mut guard = entry.write().await;
            guard.schema_ref = None;
            guard.schema = None;
        }
    }

    /// Analyse the current text of a document.
    ///
    /// Returns `None` when the document was closed or edited again before
    /// the analysis finished; the result is then discarded.
    pub async fn analyze(&self, id: &str) -> Option<Installed> {
        let entry = self.entry(id)?;
        let (text, version, cached) = {
            let guard = entry.read().await;
            (
                guard.text.clone(),
                guard.version,
                guard.schema_ref.clone().zip(guard.schema.clone()),
            )
        };

        let parsed = parse(&text);
        let document = parsed.document;
        let mut diagnostics = parsed.diagnostics;

        let schema_ref = document.schema.as_ref().map(|decl| decl.path.clone());
        let schema = match &document.schema {
            None => None,
            Some(decl) => match cached {
                Some((reference, schema)) if reference == decl.path => Some(schema),
                _ => match self.schemas.load(id, &decl.path).await {
                    Ok(schema) => Some(schema),
                    Err(e) => {
                        warn!("Cannot load schema '{}' for {}: {}", decl.path, id, e);
                        diagnostics.push(Diagnostic::error(
                            DiagnosticCode::SchemaUnavailable,
                            format!("Cannot load schema '{}': {}", decl.path, e),
                            decl.location.clone(),
                        ));
                        None
                    }
                },
            },
        };

        let mut terminology_checks = Vec::new();
        if let Some(schema) = &schema {
            let resolution = resolve(&document, schema);
            diagnostics.extend(resolution.diagnostics);
            terminology_checks = resolution.terminology_checks;
        }
        normalize(&mut diagnostics);

        let analysis = Arc::new(Analysis {
            version,
            text: text.into(),
            document,
            diagnostics,
        });

        let mut guard = entry.write().await;
        if guard.version != version || !self.is_current(id, &entry) {
            debug!(
                "Discarding analysis of {} at version {} (now {})",
                id, version, guard.version
            );
            return None;
        }
        guard.schema_ref = schema_ref;
        guard.schema = schema;
        guard.analysis = Some(Arc::clone(&analysis));
        Some(Installed {
            analysis,
            terminology_checks,
        })
    }

    /// Merge terminology results into the analysis of `version`.
    ///
    /// Returns the updated analysis, or `None` if the document moved on.
    pub async fn apply_terminology(
        &self,
        id: &str,
        version: u64,
        outcome: TerminologyOutcome,
    ) -> Option<Arc<Analysis>> {
        let entry = self.entry(id)?;
        let mut guard = entry.write().await;
        if guard.version != version {
            debug!("Discarding terminology results of {} at version {}", id, version);
            return None;
        }
        let current = guard.analysis.as_ref().filter(|a| a.version == version)?;
        let mut diagnostics = current.diagnostics.clone();
        diagnostics.extend(outcome.diagnostics);
        normalize(&mut diagnostics);
        let analysis = Arc::new(Analysis {
            version,
            text: Arc::clone(&current.text),
            document: current.document.clone(),
            diagnostics,
        });
        guard.analysis = Some(Arc::clone(&analysis));
        Some(analysis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redmatch_core::{Location, SourceFormat, load_schema};
    use tokio::sync::Notify;

    const DOC: &str = "file:///study/rules.rdm";

    fn schema() -> Schema {
        let export = r#"[
            {"field_name": "record_id", "field_type": "text", "field_label": "Record ID",
             "select_choices_or_calculations": "", "text_validation_type_or_show_slider_number": ""},
            {"field_name": "pat_dob", "field_type": "text", "field_label": "Date of birth",
             "select_choices_or_calculations": "", "text_validation_type_or_show_slider_number": "date_ymd"}
        ]"#;
        load_schema(export, SourceFormat::Json).unwrap()
    }

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(
            MemorySchemaSource::new().with_schema("study.json", schema()),
        ))
    }

    const RULES: &str = "SCHEMA: 'study.json' (REDCAP)
RULES: {
  NOTNULL(pat_dob) { Patient<p>: * birthDate = VALUE(pat_dob) }
}";

    /// Blocks every load until released
    struct GatedSource {
        entered: Notify,
        release: Notify,
        inner: MemorySchemaSource,
    }

    #[async_trait]
    impl SchemaSource for GatedSource {
        async fn load(&self, document: &str, reference: &str) -> redmatch_core::Result<Arc<Schema>> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.load(document, reference).await
        }
    }

    #[tokio::test]
    async fn test_analysis_is_installed() {
        let store = store();
        let version = store.update(DOC, RULES.to_string()).await;
        let installed = store.analyze(DOC).await.unwrap();

        assert_eq!(installed.analysis.version, version);
        assert!(installed.analysis.diagnostics.is_empty());
        assert_eq!(store.schema(DOC).await.unwrap().len(), 2);
        assert_eq!(store.analysis(DOC).await.unwrap().version, version);
    }

    #[tokio::test]
    async fn test_unknown_field_is_reported() {
        let store = store();
        store
            .update(DOC, RULES.replace("VALUE(pat_dob)", "VALUE(pat_dox)"))
            .await;
        let installed = store.analyze(DOC).await.unwrap();
        let codes: Vec<DiagnosticCode> = installed
            .analysis
            .diagnostics
            .iter()
            .map(|d| d.code)
            .collect();
        assert_eq!(codes, vec![DiagnosticCode::UnknownField]);
    }

    #[tokio::test]
    async fn test_unloadable_schema_is_a_diagnostic() {
        let store = store();
        store
            .update(DOC, RULES.replace("study.json", "other.json"))
            .await;
        let installed = store.analyze(DOC).await.unwrap();
        assert!(
            installed
                .analysis
                .diagnostics
                .iter()
                .any(|d| d.code == DiagnosticCode::SchemaUnavailable)
        );
        assert!(store.schema(DOC).await.is_none());
    }

    #[tokio::test]
    async fn test_stale_analysis_is_discarded() {
        let source = Arc::new(GatedSource {
            entered: Notify::new(),
            release: Notify::new(),
            inner: MemorySchemaSource::new().with_schema("study.json", schema()),
        });
        let store = Arc::new(SessionStore::new(source.clone()));
        store.update(DOC, RULES.to_string()).await;

        let first = tokio::spawn({
            let store = Arc::clone(&store);
            async move { store.analyze(DOC).await }
        });
        source.entered.notified().await;
        let newer = store
            .update(DOC, RULES.replace("VALUE(pat_dob)", "VALUE(nope)"))
            .await;
        source.release.notify_one();

        assert!(first.await.unwrap().is_none());
        assert!(store.analysis(DOC).await.is_none());

        source.release.notify_one();
        let installed = store.analyze(DOC).await.unwrap();
        assert_eq!(installed.analysis.version, newer);
        assert_eq!(installed.analysis.diagnostics.len(), 1);
    }

    #[tokio::test]
    async fn test_documents_are_independent() {
        let store = store();
        store.update("file:///a.rdm", RULES.to_string()).await;
        store.update("file:///b.rdm", "RULES: {".to_string()).await;

        let a = store.analyze("file:///a.rdm").await.unwrap();
        let b = store.analyze("file:///b.rdm").await.unwrap();
        assert!(a.analysis.diagnostics.is_empty());
        assert!(!b.analysis.diagnostics.is_empty());
        assert_eq!(store.len(), 2);

        assert!(store.close("file:///b.rdm"));
        assert!(!store.close("file:///b.rdm"));
        assert!(store.analysis("file:///b.rdm").await.is_none());
        assert!(store.analysis("file:///a.rdm").await.is_some());
    }

    #[tokio::test]
    async fn test_terminology_results_follow_version() {
        let store = store();
        let version = store.update(DOC, RULES.to_string()).await;
        store.analyze(DOC).await.unwrap();

        let skipped = Diagnostic::info(
            DiagnosticCode::TerminologySkipped,
            "Terminology server unavailable",
            Location::default(),
        );
        let outcome = TerminologyOutcome {
            diagnostics: vec![skipped.clone()],
            ..Default::default()
        };
        let merged = store
            .apply_terminology(DOC, version, outcome.clone())
            .await
            .unwrap();
        assert_eq!(merged.diagnostics, vec![skipped]);

        store.update(DOC, RULES.to_string()).await;
        assert!(store.apply_terminology(DOC, version, outcome).await.is_none());
    }

    #[tokio::test]
    async fn test_schema_is_cached_until_invalidated() {
        let store = store();
        store.update(DOC, RULES.to_string()).await;
        store.analyze(DOC).await.unwrap();
        let first = store.schema(DOC).await.unwrap();

        store.update(DOC, format!("{RULES}\n")).await;
        store.analyze(DOC).await.unwrap();
        assert!(Arc::ptr_eq(&first, &store.schema(DOC).await.unwrap()));

        store.invalidate_schema(DOC).await;
        assert!(store.schema(DOC).await.is_none());
    }

    #[test]
    fn test_schema_path_is_relative_to_document() {
        let path = FsSchemaSource::path_for("file:///work/study/rules.rdm", "dictionary.csv");
        assert_eq!(path, PathBuf::from("/work/study/dictionary.csv"));
        let path = FsSchemaSource::path_for("file:///work/rules.rdm", "/data/dictionary.json");
        assert_eq!(path, PathBuf::from("/data/dictionary.json"));
    }

    #[tokio::test]
    async fn test_filesystem_source_reads_exports() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("study.csv"),
            "\"Variable / Field Name\",\"Form Name\",\"Section Header\",\"Field Type\",\"Field Label\",\"Choices, Calculations, OR Slider Labels\",\"Field Note\",\"Text Validation Type OR Show Slider Number\"\n\
             record_id,demographics,,text,\"Record ID\",,,\n",
        )
        .unwrap();
        let document = Url::from_file_path(dir.path().join("rules.rdm")).unwrap();
        let schema = FsSchemaSource
            .load(document.as_str(), "study.csv")
            .await
            .unwrap();
        assert_eq!(schema.len(), 1);
        assert_eq!(schema.fields()[0].label, "Record ID");
    }
}
