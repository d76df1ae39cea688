//! Command implementations

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use redmatch_core::diagnostics::{has_errors, normalize};
use redmatch_core::{
    Diagnostic, Document, ExecutionOptions, Executor, FhirTerminologyClient, RecordFormat,
    RedmatchConfig, RedmatchError, Result, ResultExt, Schema, SourceFormat, TerminologyMode,
    TerminologyValidator, load_records, load_schema, load_schema_file, parse, resolve,
    run_terminology_checks,
};
use redmatch_lsp::{FsSchemaSource, ServerOptions};
use tracing::{debug, info};

use crate::output::{DiagnosticSummary, OutputFormatter};
use crate::{ConfigFormat, OutputFormat};

/// Settings shared by the commands
pub struct Context {
    pub config: RedmatchConfig,
    terminology_url: Option<String>,
}

impl Context {
    pub fn new(config: RedmatchConfig, terminology_url: Option<String>) -> Self {
        Self {
            config,
            terminology_url,
        }
    }

    /// Terminology client, when a server is configured
    fn terminology(&self) -> Result<Option<FhirTerminologyClient>> {
        let url = self
            .terminology_url
            .as_deref()
            .or(self.config.terminology.url.as_deref());
        match url {
            Some(url) => {
                debug!("Validating terminology against {}", url);
                Ok(Some(FhirTerminologyClient::new(
                    url,
                    self.config.terminology.timeout(),
                )?))
            }
            None => Ok(None),
        }
    }

    /// Schema export for a document: `--schema`, then config, then the
    /// document's own `SCHEMA:` relative to the rules file
    fn schema_path(
        &self,
        rules: &Path,
        document: &Document,
        explicit: Option<PathBuf>,
    ) -> Option<PathBuf> {
        explicit
            .or_else(|| self.config.schema.path.clone())
            .or_else(|| {
                let declared = document.schema.as_ref()?;
                let dir = rules.parent().unwrap_or_else(|| Path::new("."));
                Some(dir.join(&declared.path))
            })
    }
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| RedmatchError::io_error(path, e))
}

/// Check command implementation
pub async fn check_command(
    context: &Context,
    rules: &Path,
    schema: Option<PathBuf>,
    format: OutputFormat,
) -> Result<ExitCode> {
    debug!("Checking {}", rules.display());
    let source = read(rules)?;
    let parsed = parse(&source);
    let mut diagnostics = parsed.diagnostics;

    if let Some(schema_path) = context.schema_path(rules, &parsed.document, schema) {
        let schema = load_schema_file(&schema_path)?;
        let mut resolution = resolve(&parsed.document, &schema);
        if let Some(client) = context.terminology()? {
            let outcome = run_terminology_checks(
                &resolution.terminology_checks,
                &client,
                TerminologyMode::Interactive,
            )
            .await?;
            resolution.apply(outcome);
        }
        diagnostics.extend(resolution.diagnostics);
    }
    normalize(&mut diagnostics);

    let formatter = OutputFormatter::new(format);
    let summary = DiagnosticSummary::from_diagnostics(&diagnostics);
    formatter.print_diagnostics(rules, &source, &diagnostics, &summary)?;

    if summary.has_errors() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

/// Transform command implementation
pub async fn transform_command(
    context: &Context,
    rules: &Path,
    data: &Path,
    schema: Option<PathBuf>,
    output: Option<PathBuf>,
) -> Result<ExitCode> {
    let source = read(rules)?;
    let parsed = parse(&source);
    let schema_path = context
        .schema_path(rules, &parsed.document, schema)
        .ok_or_else(|| {
            RedmatchError::invalid_document(format!(
                "{} does not declare a SCHEMA and no --schema was given",
                rules.display()
            ))
        })?;
    let schema = load_schema_file(&schema_path)?;

    let client = context.terminology()?;
    let mut resolution = resolve(&parsed.document, &schema);
    if let Some(client) = &client {
        let outcome = run_terminology_checks(
            &resolution.terminology_checks,
            client,
            TerminologyMode::Batch,
        )
        .await?;
        resolution.apply(outcome);
    }

    let mut diagnostics: Vec<Diagnostic> = parsed.diagnostics;
    diagnostics.extend(resolution.diagnostics.iter().cloned());
    normalize(&mut diagnostics);
    if has_errors(&diagnostics) {
        let summary = DiagnosticSummary::from_diagnostics(&diagnostics);
        OutputFormatter::new(OutputFormat::Human).print_diagnostics(
            rules,
            &source,
            &diagnostics,
            &summary,
        )?;
        return Err(RedmatchError::invalid_document(format!(
            "{} has {} error(s), refusing to transform",
            rules.display(),
            summary.errors
        )));
    }

    let format = RecordFormat::from_path(data).ok_or_else(|| {
        RedmatchError::config_error(format!(
            "Cannot tell the format of '{}' (expected .csv or .json)",
            data.display()
        ))
    })?;
    let records = load_records(&read(data)?, format)?;
    info!("Transforming {} records", records.len());

    let executor = Executor::new(&resolution.document, &schema).with_options(ExecutionOptions {
        parallel: context.config.transform.parallel,
    });
    let resources = match &client {
        Some(client) => executor.execute_validated(&records, client).await?,
        None => executor.execute(&records)?,
    };

    let output_dir = output.unwrap_or_else(|| context.config.transform.output_dir.clone());
    let files = resources.write_ndjson(&output_dir)?;
    for file in &files {
        println!("  {}", file.display());
    }
    println!(
        "{} Wrote {} resources from {} records to {}",
        "✔".green(),
        resources.len(),
        records.len(),
        output_dir.display()
    );
    Ok(ExitCode::SUCCESS)
}

/// Schema command implementation
pub fn schema_command(export: &Path, format: Option<SourceFormat>) -> Result<ExitCode> {
    let schema = match format {
        Some(format) => load_schema(&read(export)?, format)?,
        None => load_schema_file(export)?,
    };
    print_schema(&schema);
    Ok(ExitCode::SUCCESS)
}

fn print_schema(schema: &Schema) {
    let header = format!("{:<32} {:<26} {}", "FIELD", "TYPE", "LABEL");
    println!("{}", header.bold());
    for field in schema.fields() {
        let id = if field.parent.is_some() {
            format!("  {}", field.id)
        } else {
            field.id.clone()
        };
        println!("{:<32} {:<26} {}", id, field.field_type.to_string(), field.label);
    }
    println!(
        "\n{} fields ({} schema)",
        schema.len(),
        schema.schema_type()
    );
}

/// Language server command implementation
pub async fn lsp_command(context: &Context) -> Result<ExitCode> {
    // Serve without terminology when the client cannot be built
    let terminology = context
        .terminology()
        .log_and_continue()
        .flatten()
        .map(|client| Arc::new(client) as Arc<dyn TerminologyValidator>);
    info!("Starting language server");
    redmatch_lsp::serve_stdio(ServerOptions {
        schemas: Arc::new(FsSchemaSource),
        terminology,
    })
    .await;
    Ok(ExitCode::SUCCESS)
}

/// Config init command implementation
pub fn config_init_command(format: ConfigFormat, force: bool) -> Result<ExitCode> {
    let filename = match format {
        ConfigFormat::Json => ".redmatchrc.json",
        ConfigFormat::Toml => ".redmatchrc.toml",
        ConfigFormat::Yaml => "redmatch.yaml",
    };
    let path = PathBuf::from(filename);

    if path.exists() && !force {
        return Err(RedmatchError::config_error(format!(
            "Configuration file '{filename}' already exists. Use --force to overwrite."
        )));
    }

    let content = RedmatchConfig::default().render(&path)?;
    fs::write(&path, content).map_err(|e| RedmatchError::io_error(&path, e))?;
    println!("{} Created configuration file: {filename}", "✔".green());
    Ok(ExitCode::SUCCESS)
}

/// Config show command implementation
pub fn config_show_command(context: &Context) -> Result<ExitCode> {
    let rendered = serde_json::to_string_pretty(&context.config).map_err(|e| {
        RedmatchError::config_error(format!("Failed to serialize config: {e}"))
    })?;
    println!("{rendered}");
    Ok(ExitCode::SUCCESS)
}
