//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use designlens_core::stages::completion_message;
use designlens_core::{
    AnalysisService, AnalysisSource, ProgressReporter, ResultStore, SubmitRequest,
    implementations,
};
use designlens_llm::{ClientConfig, OpenAiClient};
use designlens_shared::{
    AnalysisResult, AppConfig, Implementation, RequestId, StageOutcome, StepName, StepStatus,
    TrackingRecord, api_key, init_config, load_config, validate_api_key,
};
use designlens_storage::{LocalObjectStore, StatusTracker, Storage};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// DesignLens: turn qualitative research into design principles.
#[derive(Parser)]
#[command(
    name = "designlens",
    version,
    about = "Synthesize qualitative research into insights and design principles.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the five-stage synthesis on research text.
    Analyze(AnalyzeArgs),

    /// Show the progress of an analysis.
    Status {
        /// Request ID.
        id: RequestId,

        /// Print the tracking record as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the result of a completed analysis.
    Result {
        /// Request ID.
        id: RequestId,

        /// Print the full result document as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List recent analyses.
    History {
        /// Maximum number of analyses to show.
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Delete an analysis result and its tracking record.
    Delete {
        /// Request ID.
        id: RequestId,
    },

    /// Show usage statistics over stored results.
    Stats,

    /// List the available executor implementations.
    Implementations,

    /// Upload a research file for later analysis.
    Upload {
        /// Text file (.txt, .md, .markdown, .csv, .json).
        path: PathBuf,
    },

    /// Manage uploaded research files.
    Files {
        #[command(subcommand)]
        action: FilesAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Arguments of `designlens analyze`.
#[derive(Args)]
pub(crate) struct AnalyzeArgs {
    #[command(flatten)]
    pub input: InputArgs,

    /// Executor: parser, function_calling, or hybrid (defaults to config).
    #[arg(short, long)]
    pub implementation: Option<Implementation>,

    /// Use this request ID instead of generating one.
    #[arg(long)]
    pub request_id: Option<RequestId>,

    /// Leave provenance metadata out of the stored result.
    #[arg(long)]
    pub no_metadata: bool,

    /// Print the full result document as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Where the research text comes from; exactly one is required.
#[derive(Args)]
#[group(required = true, multiple = false)]
pub(crate) struct InputArgs {
    /// Read research text from a local file.
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Research text given inline.
    #[arg(short, long)]
    pub text: Option<String>,

    /// Key of an uploaded research file.
    #[arg(long)]
    pub stored: Option<String>,
}

/// Research file subcommands.
#[derive(Subcommand)]
pub(crate) enum FilesAction {
    /// List uploaded research files.
    List {
        /// Maximum number of files to show.
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Delete an uploaded research file.
    Delete {
        /// Research file key.
        key: String,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "designlens=info",
        1 => "designlens=debug",
        _ => "designlens=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Analyze(args) => cmd_analyze(args).await,
        Command::Status { id, json } => cmd_status(&id, json).await,
        Command::Result { id, json } => cmd_result(&id, json).await,
        Command::History { limit } => cmd_history(limit).await,
        Command::Delete { id } => cmd_delete(&id).await,
        Command::Stats => cmd_stats().await,
        Command::Implementations => cmd_implementations(),
        Command::Upload { path } => cmd_upload(&path).await,
        Command::Files { action } => match action {
            FilesAction::List { limit } => cmd_files_list(limit).await,
            FilesAction::Delete { key } => cmd_files_delete(&key).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

/// Open the tracking database and object store named by `config`.
async fn open_service(config: &AppConfig, readonly: bool) -> Result<AnalysisService> {
    let db_path = config.tracking_db_path();
    let tracker: Arc<dyn StatusTracker> = if readonly {
        Arc::new(Storage::open_readonly(&db_path).await?)
    } else {
        Arc::new(Storage::open(&db_path).await?)
    };
    let objects = Arc::new(LocalObjectStore::open(config.objects_dir())?);
    let store = ResultStore::from_config(objects, config);
    Ok(AnalysisService::new(tracker, store, config.clone()))
}

fn build_client(config: &AppConfig) -> Result<OpenAiClient> {
    let client = OpenAiClient::with_config(
        api_key(config)?,
        ClientConfig {
            base_url: config.llm.base_url.clone(),
            model: config.llm.model.clone(),
            temperature: config.llm.temperature,
            timeout: config.request_timeout(),
            max_retries: config.llm.max_retries,
            ..ClientConfig::default()
        },
    )?;
    Ok(client)
}

// ---------------------------------------------------------------------------
// Analysis commands
// ---------------------------------------------------------------------------

async fn cmd_analyze(args: AnalyzeArgs) -> Result<()> {
    // Validate API key before doing anything
    let config = load_config()?;
    validate_api_key(&config)?;

    let source = match (args.input.file, args.input.text, args.input.stored) {
        (Some(path), _, _) => AnalysisSource::Text(
            std::fs::read_to_string(&path)
                .map_err(|e| eyre!("cannot read '{}': {e}", path.display()))?,
        ),
        (_, Some(text), _) => AnalysisSource::Text(text),
        (_, _, Some(key)) => AnalysisSource::Stored(key),
        _ => return Err(eyre!("one of --file, --text, or --stored is required")),
    };

    let service = open_service(&config, false)
        .await?
        .with_generator(Arc::new(build_client(&config)?));

    let request = SubmitRequest {
        source,
        implementation: args.implementation,
        request_id: args.request_id,
        include_metadata: args.no_metadata.then_some(false),
    };

    let progress = Arc::new(CliProgress::new()?);
    let run = service.submit(request, progress.clone()).await?;
    let request_id = run.request_id.clone();
    info!(%request_id, model = %config.llm.model, "analysis started");

    let document = tokio::select! {
        document = run.finished() => document,
        _ = tokio::signal::ctrl_c() => {
            progress.set_message("Cancelling...");
            service.cancel(&request_id);
            service.wait(&request_id).await;
            None
        }
    };
    progress.finish();

    let record = service.status(&request_id).await?;
    let Some(document) = document else {
        print_status(&record);
        return Err(eyre!("analysis {request_id} was cancelled"));
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(document.as_ref())?);
    } else {
        print_result(&document);
    }

    if let Some(err) = &record.storage_error {
        eprintln!("warning: result was not stored: {err}");
    }

    if document.status == StepStatus::Failed {
        let reason = record
            .failure_message
            .unwrap_or_else(|| "unknown error".into());
        return Err(eyre!("analysis {request_id} failed: {reason}"));
    }

    Ok(())
}

async fn cmd_status(id: &RequestId, json: bool) -> Result<()> {
    let config = load_config()?;
    let service = open_service(&config, true).await?;
    let record = service.status(id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print_status(&record);
    }
    Ok(())
}

async fn cmd_result(id: &RequestId, json: bool) -> Result<()> {
    let config = load_config()?;
    let service = open_service(&config, true).await?;
    let result = service.result(id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(())
}

async fn cmd_history(limit: usize) -> Result<()> {
    let config = load_config()?;
    let service = open_service(&config, true).await?;
    let records = service.list_analyses(limit).await?;

    if records.is_empty() {
        println!("No analyses yet.");
        return Ok(());
    }

    println!(
        "  {:<38} {:<11} {:<17} {:<10} CREATED",
        "REQUEST", "STATUS", "IMPLEMENTATION", "STEP"
    );
    for record in &records {
        let step = record
            .current_step()
            .map_or("-", |step| step.as_str());
        println!(
            "  {:<38} {:<11} {:<17} {:<10} {}",
            record.request_id,
            record.overall_status.as_str(),
            record.implementation.as_str(),
            step,
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

async fn cmd_delete(id: &RequestId) -> Result<()> {
    let config = load_config()?;
    let service = open_service(&config, false).await?;

    if service.delete_analysis(id).await? {
        println!("Deleted analysis {id}");
        Ok(())
    } else {
        Err(eyre!("no analysis found with ID '{id}'"))
    }
}

async fn cmd_stats() -> Result<()> {
    let config = load_config()?;
    let service = open_service(&config, false).await?;
    let stats = service.stats().await?;

    println!();
    println!("  Analyses:   {}", stats.total_analyses);
    println!("  Completed:  {}", stats.completed);
    println!("  Failed:     {}", stats.failed);
    if let Some(avg) = stats.average_execution_time {
        println!("  Avg. time:  {avg:.1}s");
    }
    println!("  Stored:     {} bytes", stats.total_size_bytes);
    if !stats.implementations_used.is_empty() {
        println!("  By implementation:");
        for (name, count) in &stats.implementations_used {
            println!("    {name:<17} {count}");
        }
    }
    println!();
    Ok(())
}

fn cmd_implementations() -> Result<()> {
    let config = load_config()?;
    for info in implementations(config.defaults.implementation) {
        let marker = if info.default { " (default)" } else { "" };
        println!("  {}{marker}", info.name);
        println!("    {}", info.framework);
        println!("    {}", info.description);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Research file commands
// ---------------------------------------------------------------------------

async fn cmd_upload(path: &std::path::Path) -> Result<()> {
    let config = load_config()?;
    let bytes = std::fs::read(path).map_err(|e| eyre!("cannot read '{}': {e}", path.display()))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| eyre!("'{}' is not a file", path.display()))?;

    let service = open_service(&config, false).await?;
    let file = service.upload_research(&filename, &bytes).await?;

    println!();
    println!("  Research file uploaded!");
    println!("  Key:    {}", file.key);
    println!("  Size:   {} bytes", file.size_bytes);
    if let Some(sha) = &file.sha256 {
        println!("  SHA256: {sha}");
    }
    println!();
    println!("  Analyze it with: designlens analyze --stored {}", file.key);
    println!();
    Ok(())
}

async fn cmd_files_list(limit: usize) -> Result<()> {
    let config = load_config()?;
    let service = open_service(&config, false).await?;
    let files = service.list_research(limit).await?;

    if files.is_empty() {
        println!("No research files uploaded.");
        return Ok(());
    }
    for file in &files {
        println!(
            "  {}  {:>8} bytes  {}",
            file.uploaded_at.format("%Y-%m-%d %H:%M:%S"),
            file.size_bytes,
            file.key
        );
    }
    Ok(())
}

async fn cmd_files_delete(key: &str) -> Result<()> {
    let config = load_config()?;
    let service = open_service(&config, false).await?;

    if service.delete_research(key).await? {
        println!("Deleted {key}");
        Ok(())
    } else {
        Err(eyre!("no research file found at '{key}'"))
    }
}

// ---------------------------------------------------------------------------
// Config commands
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_status(record: &TrackingRecord) {
    println!();
    println!("  Request:        {}", record.request_id);
    println!("  Status:         {}", record.overall_status.as_str());
    println!("  Implementation: {}", record.implementation);
    println!("  Source:         {}", record.source_ref);
    println!(
        "  Created:        {}",
        record.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!();
    for step in StepName::ALL {
        if let Some(s) = record.step(step) {
            println!("  {:<11} {:<11} {}", step.as_str(), s.status.as_str(), s.message);
        }
    }
    if !record.result_data.is_empty() {
        println!();
        println!("  Result:  {}", record.result_data);
    }
    if let (Some(kind), Some(message)) = (&record.failure_kind, &record.failure_message) {
        println!("  Failure: [{kind}] {message}");
    }
    if let Some(err) = &record.storage_error {
        println!("  Storage: {err}");
    }
    println!();
}

fn print_result(result: &AnalysisResult) {
    println!();
    println!("  Analysis {}", result.status.as_str());
    println!("  ID:             {}", result.request_id);
    println!("  Implementation: {}", result.implementation);
    println!("  Chunks:         {}", result.chunks.len());
    println!("  Inferences:     {}", result.inferences.len());
    println!("  Patterns:       {}", result.patterns.len());
    println!("  Insights:       {}", result.insights.len());
    println!("  Principles:     {}", result.design_principles.len());
    println!("  Time:           {:.1}s", result.execution_time);

    if let Some(metadata) = &result.metadata {
        let fallbacks: Vec<&str> = metadata
            .stages
            .iter()
            .filter(|s| s.used_fallback)
            .map(|s| s.step.as_str())
            .collect();
        if !fallbacks.is_empty() {
            println!("  Fallbacks:      {}", fallbacks.join(", "));
        }
        if let Some(err) = &metadata.error {
            println!("  Error:          {err}");
        }
    }

    if !result.insights.is_empty() {
        println!();
        println!("  Insights");
        for insight in &result.insights {
            println!("    {} ({:.2})", insight.headline, insight.impact_score);
            println!("      {}", insight.explanation);
        }
    }
    if !result.design_principles.is_empty() {
        println!();
        println!("  Design principles");
        for principle in &result.design_principles {
            println!("    - {}", principle.principle);
            println!("      {}", principle.design_direction);
        }
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Result<Self> {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")?
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Ok(Self { spinner })
    }

    fn set_message(&self, message: &str) {
        self.spinner.set_message(message.to_string());
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn stage_started(&self, step: StepName) {
        self.spinner.set_message(format!(
            "[{}/{}] Creating {}...",
            step.position() + 1,
            StepName::ALL.len(),
            step.output_noun()
        ));
    }

    fn stage_finished(&self, step: StepName, outcome: &StageOutcome) {
        self.spinner
            .println(format!("  ✓ {:<11} {}", step.as_str(), completion_message(outcome)));
    }
}
