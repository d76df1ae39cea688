//! Redmatch CLI
//!
//! Command-line interface for checking Redmatch rules documents and
//! transforming REDCap records into FHIR resources

mod commands;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use redmatch_core::{ConfigLoader, Result, SourceFormat, init_tracing, init_tracing_json};
use tracing::error;

use commands::Context;

#[derive(Parser)]
#[command(name = "redmatch")]
#[command(about = "Redmatch: map REDCap study data to FHIR resources")]
#[command(version = redmatch_core::VERSION)]
#[command(
    long_about = "Redmatch checks rules documents against REDCap data dictionaries and\n\
applies them to exported records to produce FHIR resources.\n\
\n\
Examples:\n  \
redmatch check study.rdm                          # Report diagnostics\n  \
redmatch transform study.rdm --data records.csv   # Write NDJSON to ./output\n  \
redmatch schema dictionary.csv                    # List the fields of an export\n  \
redmatch config init                              # Create a configuration file"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(
        short,
        long,
        global = true,
        help = "Path to configuration file (.redmatchrc.json/.redmatchrc.toml/redmatch.yaml)"
    )]
    config: Option<PathBuf>,

    /// Verbose output (can be used multiple times for increased verbosity)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Number of threads to use for parallel processing
    #[arg(
        short = 'j',
        long,
        global = true,
        help = "Number of threads (default: number of CPU cores)"
    )]
    threads: Option<usize>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    /// Terminology server used to validate codes
    #[arg(long, global = true, env = "REDMATCH_TERMINOLOGY_URL")]
    terminology_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and resolve a rules document and report its diagnostics
    Check {
        /// Rules document
        rules: PathBuf,

        /// Schema export, overriding the document's SCHEMA
        #[arg(long)]
        schema: Option<PathBuf>,

        /// Output format
        #[arg(
            short,
            long,
            default_value = "human",
            help = "Output format for diagnostics"
        )]
        format: OutputFormat,
    },

    /// Transform records into FHIR resources written as NDJSON
    Transform {
        /// Rules document
        rules: PathBuf,

        /// Records exported from REDCap (.csv or .json)
        #[arg(short, long)]
        data: PathBuf,

        /// Schema export, overriding the document's SCHEMA
        #[arg(long)]
        schema: Option<PathBuf>,

        /// Output directory
        #[arg(short, long, help = "Output directory (default: output)")]
        output: Option<PathBuf>,
    },

    /// Import a schema export and list its fields
    Schema {
        /// Data dictionary export
        export: PathBuf,

        /// Export format (default: from the file extension)
        #[arg(short, long)]
        format: Option<ExportFormat>,
    },

    /// Serve the language server on stdin/stdout
    Lsp,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Create a configuration file in the current directory
    Init {
        #[arg(short, long, default_value = "json")]
        format: ConfigFormat,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the configuration in effect
    Show,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output with source excerpts
    Human,
    /// JSON output for tooling
    Json,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ExportFormat {
    Json,
    Csv,
}

impl From<ExportFormat> for SourceFormat {
    fn from(format: ExportFormat) -> Self {
        match format {
            ExportFormat::Json => SourceFormat::Json,
            ExportFormat::Csv => SourceFormat::Csv,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum ConfigFormat {
    /// .redmatchrc.json
    Json,
    /// .redmatchrc.toml
    Toml,
    /// redmatch.yaml
    Yaml,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if !cli.no_color && std::env::var("NO_COLOR").is_err() {
        colored::control::set_override(true);
    } else {
        colored::control::set_override(false);
    }

    let log_level = match cli.verbose {
        0 => "redmatch=error",
        1 => "redmatch=warn",
        2 => "redmatch=info",
        3 => "redmatch=debug",
        _ => "redmatch=trace",
    };
    unsafe {
        std::env::set_var("RUST_LOG", log_level);
    }
    if cli.log_json {
        init_tracing_json();
    } else {
        init_tracing();
    }

    if let Some(threads) = cli.threads
        && let Err(e) = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
    {
        error!("Failed to set thread pool size: {}", e);
        return ExitCode::FAILURE;
    }

    match run_command(cli).await {
        Ok(code) => code,
        Err(e) => {
            let reported = e.report();
            eprintln!("{} {}", "error:".red().bold(), reported);
            ExitCode::FAILURE
        }
    }
}

async fn run_command(cli: Cli) -> Result<ExitCode> {
    let Some(command) = cli.command else {
        let mut cmd = Cli::command();
        cmd.print_help()?;
        return Ok(ExitCode::SUCCESS);
    };

    // `config init` must work where no valid config exists yet
    if let Commands::Config {
        action: ConfigAction::Init { format, force },
    } = command
    {
        return commands::config_init_command(format, force);
    }

    let config = ConfigLoader::load(cli.config.as_deref(), None)?;
    let context = Context::new(config, cli.terminology_url);

    match command {
        Commands::Check {
            rules,
            schema,
            format,
        } => commands::check_command(&context, &rules, schema, format).await,

        Commands::Transform {
            rules,
            data,
            schema,
            output,
        } => commands::transform_command(&context, &rules, &data, schema, output).await,

        Commands::Schema { export, format } => {
            commands::schema_command(&export, format.map(SourceFormat::from))
        }

        Commands::Lsp => commands::lsp_command(&context).await,

        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_show_command(&context),
            ConfigAction::Init { format, force } => commands::config_init_command(format, force),
        },
    }
}
