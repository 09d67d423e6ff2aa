//! CLI binary for pdf-ocr-batch.
//!
//! A thin shim over the library crate that maps CLI flags to `OcrConfig`,
//! wires Ctrl-C to the run's cancellation token, and turns the batch outcome
//! into a process exit status.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use pdf_ocr_batch::credentials::apply_key_pools;
use pdf_ocr_batch::progress::ProgressState;
use pdf_ocr_batch::{
    run_batch, AbortReason, BatchProgressCallback, BatchStatus, BatchSummary, DocumentId,
    DocumentOutcome, DocumentStatus, FailedPagePolicy, ImageEncoding, OcrConfig, OcrError,
    ProgressCallback,
};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one progress bar per document plus a log line
/// per page.
struct CliProgressCallback {
    bar: Mutex<Option<ProgressBar>>,
    page_started: Mutex<Option<Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bar: Mutex::new(None),
            page_started: Mutex::new(None),
            errors: AtomicUsize::new(0),
        })
    }

    fn println(&self, line: String) {
        match self.bar.lock().ok().as_deref().and_then(Option::as_ref) {
            Some(bar) => bar.println(line),
            None => eprintln!("{line}"),
        }
    }

    fn page_elapsed(&self) -> f64 {
        self.page_started
            .lock()
            .ok()
            .and_then(|mut t| t.take())
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    fn inc(&self) {
        if let Some(bar) = self.bar.lock().ok().as_deref().and_then(Option::as_ref) {
            bar.inc(1);
        }
    }
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_documents: usize) {
        eprintln!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{total_documents} documents to process"))
        );
    }

    fn on_document_start(&self, document: &DocumentId, total_pages: usize, already_done: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        let bar = ProgressBar::new(total_pages as u64);
        bar.set_style(style);
        bar.set_prefix(document.to_string());
        bar.set_position(already_done as u64);
        bar.reset_eta();
        bar.enable_steady_tick(Duration::from_millis(80));
        if already_done > 0 {
            bar.println(format!(
                "{} {}  {}",
                cyan("↻"),
                bold(document.as_str()),
                dim(&format!("resuming, {already_done}/{total_pages} pages already done"))
            ));
        }
        if let Ok(mut slot) = self.bar.lock() {
            *slot = Some(bar);
        }
    }

    fn on_page_start(&self, _document: &DocumentId, page_num: usize, _total: usize) {
        if let Ok(mut t) = self.page_started.lock() {
            *t = Some(Instant::now());
        }
        if let Some(bar) = self.bar.lock().ok().as_deref().and_then(Option::as_ref) {
            bar.set_message(format!("page {page_num}"));
        }
    }

    fn on_page_complete(&self, _document: &DocumentId, page_num: usize, total: usize, text_len: usize) {
        let elapsed = self.page_elapsed();
        self.println(format!(
            "  {} Page {:>3}/{:<3}  {:<8}  {}",
            green("✓"),
            page_num,
            total,
            dim(&format!("{text_len:>5} chars")),
            dim(&format!("{elapsed:.1}s")),
        ));
        self.inc();
    }

    fn on_page_error(&self, _document: &DocumentId, page_num: usize, total: usize, error: &str) {
        let elapsed = self.page_elapsed();
        self.errors.fetch_add(1, Ordering::SeqCst);

        // Truncate very long error messages to keep output tidy.
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };

        self.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            page_num,
            total,
            red(&msg),
            dim(&format!("{elapsed:.1}s")),
        ));
        self.inc();
    }

    fn on_document_complete(&self, document: &DocumentId, outcome: &DocumentOutcome) {
        if let Some(bar) = self.bar.lock().ok().and_then(|mut slot| slot.take()) {
            bar.finish_and_clear();
        }
        let line = match outcome {
            DocumentOutcome::Completed => format!("{} {}", green("✔"), bold(document.as_str())),
            DocumentOutcome::StoppedByRateLimit => format!(
                "{} {}  {}",
                yellow("⏸"),
                bold(document.as_str()),
                yellow("stopped by rate limiting")
            ),
            DocumentOutcome::Aborted(reason) => format!(
                "{} {}  {}",
                red("✘"),
                bold(document.as_str()),
                red(&abort_label(reason))
            ),
        };
        eprintln!("{line}");
    }
}

fn abort_label(reason: &AbortReason) -> String {
    match reason {
        AbortReason::Unreadable(detail) => format!("unreadable: {detail}"),
        AbortReason::Unauthorized(detail) => format!("credential rejected: {detail}"),
        AbortReason::ModelUnavailable(detail) => format!("model unavailable: {detail}"),
        AbortReason::Interrupted => "interrupted".to_string(),
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # OCR every PDF in ./pdfs into ./ocr_output (resumes automatically)
  pdf-ocr

  # Other folders, faster pacing for a paid tier
  pdf-ocr --input-dir scans -o text --request-delay-ms 500

  # Attempt pages recorded as failed again
  pdf-ocr --retry-failed

  # Show what the progress file knows (no API key needed)
  pdf-ocr --status

EXIT STATUS:
  0     every document completed
  75    stopped by rate limiting; run again after the quota resets
  78    configuration error (no API key, no input, key rejected, unknown model)
  130   interrupted (Ctrl-C / SIGTERM); progress is saved
  1     some PDFs could not be opened, or any other error

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY          Google Gemini API key (or a JSON array of keys)
  GOOGLE_API_KEY          Alternative name for the Gemini key
  OPENAI_API_KEY          OpenAI API key (or a JSON array of keys)
  ANTHROPIC_API_KEY       Anthropic API key (or a JSON array of keys)
  EDGEQUAKE_LLM_PROVIDER  Override provider (gemini, openai, anthropic, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium; otherwise the system library is used
  RUST_LOG                Log filter, e.g. pdf_ocr_batch=debug
"#;

/// Resumable batch OCR of PDF folders using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "pdf-ocr",
    version,
    about = "Resumable batch OCR of PDF folders using Vision LLMs",
    long_about = "Render every page of every PDF in a folder, transcribe it with a Vision \
Language Model, and write one text file per document. Progress is saved after every page, \
so an interrupted or rate-limited run resumes where it stopped.",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Folder containing the PDFs to process.
    #[arg(long, env = "PDF_OCR_INPUT_DIR", default_value = "pdfs")]
    input_dir: PathBuf,

    /// Folder used when the input folder does not exist.
    #[arg(long, env = "PDF_OCR_FALLBACK_DIR", default_value = "pdfs_compressed")]
    fallback_dir: PathBuf,

    /// Folder receiving one `<name>_ocr.txt` per document.
    #[arg(short, long, env = "PDF_OCR_OUTPUT_DIR", default_value = "ocr_output")]
    output_dir: PathBuf,

    /// Progress file used to resume interrupted runs.
    #[arg(long, env = "PDF_OCR_PROGRESS_FILE", default_value = "ocr_progress.json")]
    progress_file: PathBuf,

    /// LLM model ID (e.g. gemini-2.5-pro, gemini-2.5-flash, gpt-4.1-mini).
    #[arg(long, env = "PDF_OCR_MODEL")]
    model: Option<String>,

    /// LLM provider: gemini, openai, anthropic, ollama.
    #[arg(
        long,
        env = "PDF_OCR_PROVIDER",
        long_help = "LLM provider. Auto-detected from API key env vars if not set."
    )]
    provider: Option<String>,

    /// Pause before every API call, in milliseconds.
    #[arg(long, env = "PDF_OCR_REQUEST_DELAY_MS", default_value_t = 3_000)]
    request_delay_ms: u64,

    /// Additional attempts per page on transient errors (503, 500, network).
    #[arg(long, env = "PDF_OCR_MAX_RETRIES", default_value_t = 10)]
    max_retries: u32,

    /// First retry delay in milliseconds; doubles on every retry.
    #[arg(long, env = "PDF_OCR_RETRY_BACKOFF_MS", default_value_t = 10_000)]
    retry_backoff_ms: u64,

    /// Upper bound for a single retry delay in milliseconds.
    #[arg(long, env = "PDF_OCR_RETRY_BACKOFF_CAP_MS", default_value_t = 300_000)]
    retry_backoff_cap_ms: u64,

    /// Per-call timeout in seconds (0 disables it).
    #[arg(long, env = "PDF_OCR_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Attempt pages recorded as failed by an earlier run again.
    #[arg(long, env = "PDF_OCR_RETRY_FAILED")]
    retry_failed: bool,

    /// Longest edge of a rendered page, in pixels.
    #[arg(long, env = "PDF_OCR_MAX_PIXELS", default_value_t = 2048,
          value_parser = clap::value_parser!(u32).range(100..=10_000))]
    max_pixels: u32,

    /// Image format sent to the model.
    #[arg(long, env = "PDF_OCR_IMAGE_FORMAT", value_enum, default_value = "jpeg")]
    image_format: ImageFormatArg,

    /// JPEG quality (1–100).
    #[arg(long, env = "PDF_OCR_JPEG_QUALITY", default_value_t = 85,
          value_parser = clap::value_parser!(u8).range(1..=100))]
    jpeg_quality: u8,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDF_OCR_PASSWORD")]
    password: Option<String>,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "PDF_OCR_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Max LLM output tokens per page.
    #[arg(long, env = "PDF_OCR_MAX_TOKENS", default_value_t = 8192)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "PDF_OCR_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Print the progress file summary and exit.
    #[arg(long)]
    status: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDF_OCR_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF_OCR_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF_OCR_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ImageFormatArg {
    Jpeg,
    Png,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.status;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else if show_progress {
        "warn"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    if cli.status {
        return match print_status(&cli.progress_file) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => report_error(&e),
        };
    }

    // The environment is edited before the runtime starts any thread.
    apply_key_pools();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
    {
        Ok(rt) => rt,
        Err(e) => return report_error(&e),
    };

    match runtime.block_on(run(cli, show_progress)) {
        Ok(status) => ExitCode::from(status.exit_code()),
        Err(e) => report_error(&e),
    }
}

async fn run(cli: Cli, show_progress: bool) -> Result<BatchStatus> {
    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new();
        Some(cb as Arc<dyn BatchProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb).await?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let summary = run_batch(&config, cancel)
        .await
        .context("Batch failed")?;

    if !cli.quiet {
        print_summary(&summary, &config.output_dir);
    }
    Ok(summary.status)
}

/// Cancel `token` on Ctrl-C, or on SIGTERM where available.
async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    warn!("Interrupt received; finishing the current step and saving progress");
    token.cancel();
}

/// Map CLI args to `OcrConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<OcrConfig> {
    let image_encoding = match cli.image_format {
        ImageFormatArg::Jpeg => ImageEncoding::Jpeg {
            quality: cli.jpeg_quality,
        },
        ImageFormatArg::Png => ImageEncoding::Png,
    };
    let failed_page_policy = if cli.retry_failed {
        FailedPagePolicy::Retry
    } else {
        FailedPagePolicy::Terminal
    };

    let mut builder = OcrConfig::builder()
        .input_dir(&cli.input_dir)
        .fallback_input_dir(Some(cli.fallback_dir.clone()))
        .output_dir(&cli.output_dir)
        .progress_file(&cli.progress_file)
        .request_delay_ms(cli.request_delay_ms)
        .max_retries(cli.max_retries)
        .retry_backoff_ms(cli.retry_backoff_ms)
        .retry_backoff_cap_ms(cli.retry_backoff_cap_ms)
        .api_timeout_secs(cli.api_timeout)
        .failed_page_policy(failed_page_policy)
        .max_rendered_pixels(cli.max_pixels)
        .image_encoding(image_encoding)
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature);

    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref password) = cli.password {
        builder = builder.password(password);
    }
    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

fn status_label(status: DocumentStatus) -> String {
    match status {
        DocumentStatus::Completed => green("completed"),
        DocumentStatus::InProgress => cyan("in progress"),
        DocumentStatus::StoppedByRateLimit => yellow("rate limited"),
        DocumentStatus::Unreadable => red("unreadable"),
    }
}

/// Print what the progress file records, without touching it.
fn print_status(progress_file: &Path) -> Result<()> {
    let bytes = match std::fs::read(progress_file) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            println!("No progress recorded yet ({})", progress_file.display());
            return Ok(());
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read {}", progress_file.display()))
        }
    };
    let state: ProgressState = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse {}", progress_file.display()))?;

    if state.documents.is_empty() {
        println!("No documents recorded in {}", progress_file.display());
        return Ok(());
    }
    for (id, doc) in &state.documents {
        println!(
            "{:<40}  {:>4}/{:<4} done  {:>3} failed  {}",
            id.as_str(),
            doc.done_pages(),
            doc.page_count,
            doc.failed_pages(),
            status_label(doc.status)
        );
        if let Some(detail) = &doc.last_error {
            println!("    {}", dim(detail));
        }
    }
    Ok(())
}

fn print_summary(summary: &BatchSummary, output_dir: &Path) {
    let stats = &summary.stats;
    let (mark, headline) = match summary.status {
        BatchStatus::Completed => (green("✔"), "Batch completed".to_string()),
        BatchStatus::Incomplete => (
            red("✘"),
            "Batch finished, but some PDFs could not be opened".to_string(),
        ),
        BatchStatus::RateLimited => (
            yellow("⏸"),
            "Stopped by rate limiting; run again once the quota resets".to_string(),
        ),
        BatchStatus::Interrupted => (yellow("⏸"), "Interrupted; progress saved".to_string()),
        BatchStatus::ConfigurationError => (
            red("✘"),
            "Stopped: the provider rejected the credential or model".to_string(),
        ),
    };
    eprintln!("{mark} {}", bold(&headline));
    eprintln!(
        "   {} pages done  /  {} failed  /  {} skipped  /  {} API calls  →  {}",
        stats.pages_done,
        if stats.pages_failed > 0 {
            red(&stats.pages_failed.to_string())
        } else {
            stats.pages_failed.to_string()
        },
        dim(&stats.pages_skipped.to_string()),
        stats.api_calls,
        bold(&output_dir.display().to_string()),
    );
    if !summary.not_started.is_empty() {
        eprintln!(
            "   {} documents not started",
            dim(&summary.not_started.len().to_string())
        );
    }
}

fn report_error(err: &anyhow::Error) -> ExitCode {
    eprintln!("{} {err:#}", red("error:"));
    let configuration = err
        .downcast_ref::<OcrError>()
        .is_some_and(OcrError::is_configuration);
    if configuration {
        ExitCode::from(BatchStatus::ConfigurationError.exit_code())
    } else {
        ExitCode::FAILURE
    }
}
