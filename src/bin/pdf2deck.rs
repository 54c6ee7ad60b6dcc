//! CLI binary for edgequake-pdf2deck.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, runs the pipeline, applies `--mutate` instructions and
//! writes the results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_pdf2deck::client::{credential_env_var, validate_credential};
use edgequake_pdf2deck::export::{markdown_report, write_atomic};
use edgequake_pdf2deck::{
    parse_blueprint, DocumentSession, EngineUsed, LocalOcrConfig, Pipeline, PipelineConfig,
    PipelineProgressCallback, PipelineState, ProgressCallback,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
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

fn truncate(msg: &str, max: usize) -> String {
    if msg.chars().count() > max {
        let cut: String = msg.chars().take(max - 1).collect();
        format!("{cut}\u{2026}")
    } else {
        msg.to_string()
    }
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress: one bar that is reused for the OCR pages and then for
/// the cleaning chunks, with a log line per finished unit.
struct CliProgressCallback {
    bar: ProgressBar,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening document…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
        })
    }

    /// Switch to a counting bar of `total` units.
    fn activate_bar(&self, total: usize, unit: &str) {
        let style = ProgressStyle::with_template(&format!(
            "{{spinner:.cyan}} {{prefix:.bold}}  \
             [{{bar:42.green/238}}] {{pos:>3}}/{{len}} {unit}  \
             ⏱ {{elapsed_precise}}  {{msg}}"
        ))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_style(style);
        self.bar.set_length(total as u64);
        self.bar.set_position(0);
        self.bar.reset_eta();
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_state_change(&self, state: PipelineState) {
        let prefix = match state {
            PipelineState::Extracting => "Extracting",
            PipelineState::ClassifyingOcr => "OCR",
            PipelineState::Cleaning => "Cleaning",
            PipelineState::Structuring => "Structuring",
            PipelineState::Ready => "Ready",
            PipelineState::Mutating => "Mutating",
            PipelineState::Failed => "Failed",
        };
        self.bar.set_prefix(prefix);
        match state {
            PipelineState::Structuring | PipelineState::Mutating => {
                self.bar.set_message("waiting for the model…")
            }
            _ => self.bar.set_message(""),
        }
    }

    fn on_page_extracted(&self, total_pages: usize, digital_pages: usize, rendered_pages: usize) {
        self.bar.println(format!(
            "{} {}  {}",
            cyan("◆"),
            bold(&format!("{total_pages} pages")),
            dim(&format!("{digital_pages} digital, {rendered_pages} to OCR")),
        ));
        if rendered_pages > 0 {
            self.activate_bar(rendered_pages, "pages");
        }
    }

    fn on_page_ocr_complete(&self, page_num: usize, engine: EngineUsed, text_len: usize) {
        self.bar.println(format!(
            "  {} Page {:>3}  {:<6}  {}",
            green("✓"),
            page_num,
            engine.to_string(),
            dim(&format!("{text_len:>5} chars")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_num: usize, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} Page {:>3}  {}",
            red("✗"),
            page_num,
            red(&truncate(error, 80)),
        ));
        self.bar.inc(1);
    }

    fn on_chunk_start(&self, chunk_index: usize, total_chunks: usize) {
        if chunk_index == 1 {
            self.activate_bar(total_chunks, "parts");
        }
        self.bar.set_message(format!("Part {chunk_index}"));
    }

    fn on_chunk_complete(&self, chunk_index: usize, total_chunks: usize, text_len: usize) {
        self.bar.println(format!(
            "  {} Part {:>2}/{:<2}  {}",
            green("✓"),
            chunk_index,
            total_chunks,
            dim(&format!("{text_len:>6} chars")),
        ));
        self.bar.inc(1);
    }

    fn on_chunk_error(&self, chunk_index: usize, total_chunks: usize, error: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} Part {:>2}/{:<2}  {}",
            red("✗"),
            chunk_index,
            total_chunks,
            red(&truncate(error, 80)),
        ));
        self.bar.inc(1);
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Blueprint JSON on stdout
  pdf2deck lecture.pdf

  # Write the blueprint, the cleaned text and a Markdown report
  pdf2deck lecture.pdf -o deck.json --cleaned-out cleaned.md --report deck.md

  # Revise the deck right after generating it (applied in order)
  pdf2deck notes.pdf --mutate "Merge slides 2 and 3" --mutate "Add a summary slide"

  # Revise an existing blueprint without re-running the pipeline
  pdf2deck --blueprint deck.json --mutate "Shorten every bullet" -o deck.json

  # Remote OCR only (no tesseract), OpenAI instead of Gemini
  pdf2deck --no-local-ocr --provider openai --model gpt-4.1-mini scan.pdf

  # From a URL or a single photographed page
  pdf2deck https://example.com/handout.pdf
  pdf2deck whiteboard.jpg

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY          Google Gemini API key (default provider)
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  MISTRAL_API_KEY         Mistral API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (gemini, openai, anthropic, ollama, …)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to an existing libpdfium, skips auto-download
  RUST_LOG                Log filter, e.g. edgequake_pdf2deck=debug

SETUP:
  1. Set API key:     export GEMINI_API_KEY=...
  2. Optional:        install tesseract for free local OCR of printed scans
  3. Run:             pdf2deck lecture.pdf -o deck.json

  PDFium (~30 MB) is downloaded automatically on first run and cached.
"#;

/// Turn PDFs, images and URLs into a JSON slide blueprint.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2deck",
    version,
    about = "Turn PDFs, images and URLs into a JSON slide blueprint",
    long_about = "Extract text from a PDF (digital text layer, local tesseract or remote vision \
OCR, chosen per page), clean it with an LLM in chunks, and structure it into an ordered list of \
slides. The blueprint can then be revised with free-text --mutate instructions.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF/PNG/JPEG path or HTTP/HTTPS URL.
    #[arg(required_unless_present = "blueprint")]
    input: Option<String>,

    /// Write the blueprint JSON to this file instead of stdout.
    #[arg(short, long, env = "PDF2DECK_OUTPUT")]
    output: Option<PathBuf>,

    /// Also write the cleaned Markdown to this file.
    #[arg(long, env = "PDF2DECK_CLEANED_OUT")]
    cleaned_out: Option<PathBuf>,

    /// Also write a Markdown report of the final blueprint to this file.
    #[arg(long, env = "PDF2DECK_REPORT")]
    report: Option<PathBuf>,

    /// Instruction applied to the blueprint; repeat to apply several in order.
    #[arg(long = "mutate", value_name = "INSTRUCTION")]
    mutations: Vec<String>,

    /// Start from this blueprint JSON instead of running the pipeline.
    #[arg(long, conflicts_with = "input")]
    blueprint: Option<PathBuf>,

    /// Style instruction for structuring (system prompt).
    #[arg(long, env = "PDF2DECK_STYLE", conflicts_with = "style_file")]
    style: Option<String>,

    /// Read the style instruction from a file.
    #[arg(long, env = "PDF2DECK_STYLE_FILE")]
    style_file: Option<PathBuf>,

    /// LLM provider: gemini, openai, anthropic, mistral, ollama, …
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Model ID (e.g. gemini-2.0-flash, gpt-4.1-nano).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// API key for the provider; exported to its usual variable.
    #[arg(long, hide_env_values = true)]
    api_key: Option<String>,

    /// Rendering DPI for pages without a text layer (72–400).
    #[arg(long, env = "PDF2DECK_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Pages per cleaning chunk.
    #[arg(long, env = "PDF2DECK_CHUNK_SIZE", default_value_t = 5)]
    chunk_size: usize,

    /// Pause between cleaning chunks, in milliseconds.
    #[arg(long, env = "PDF2DECK_CHUNK_DELAY_MS", default_value_t = 4000)]
    chunk_delay_ms: u64,

    /// Minimum text-layer characters for a page to count as digital.
    #[arg(long, env = "PDF2DECK_TEXT_THRESHOLD", default_value_t = 250)]
    text_threshold: usize,

    /// Edge density above which a rendered page is treated as printed.
    #[arg(long, env = "PDF2DECK_EDGE_THRESHOLD", default_value_t = 0.01)]
    edge_threshold: f64,

    /// Send every rendered page to remote vision OCR.
    #[arg(long, env = "PDF2DECK_NO_LOCAL_OCR")]
    no_local_ocr: bool,

    /// Tesseract executable.
    #[arg(long, env = "PDF2DECK_TESSERACT", default_value = "tesseract")]
    tesseract: String,

    /// Tesseract language code.
    #[arg(long, env = "PDF2DECK_OCR_LANG", default_value = "eng")]
    ocr_lang: String,

    /// Retries per remote call on transient failure.
    #[arg(long, env = "PDF2DECK_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDF2DECK_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "PDF2DECK_DOWNLOAD_TIMEOUT", default_value_t = 60)]
    download_timeout: u64,

    /// Per-attempt remote call timeout in seconds.
    #[arg(long, env = "PDF2DECK_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Disable progress bar.
    #[arg(long, env = "PDF2DECK_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF2DECK_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF2DECK_QUIET")]
    quiet: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs; verbose always wins.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Credentials ──────────────────────────────────────────────────────
    // Exported before the runtime starts so no other thread reads the
    // environment concurrently.
    if let Some(ref key) = cli.api_key {
        let provider = cli.provider.as_deref().unwrap_or("gemini");
        let var = credential_env_var(provider).with_context(|| {
            format!("--api-key given, but provider '{provider}' does not take an API key")
        })?;
        validate_credential(provider, Some(key))?;
        std::env::set_var(var, key.trim());
    }

    // ── Ensure PDFium engine is available ────────────────────────────────
    if cli.blueprint.is_none() {
        ensure_pdfium(cli.quiet)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(run(cli, show_progress))
}

fn ensure_pdfium(quiet: bool) -> Result<()> {
    if pdfium_auto::is_pdfium_cached() {
        return Ok(());
    }
    if quiet {
        pdfium_auto::ensure_pdfium_library(None).context("Failed to download PDFium engine")?;
        return Ok(());
    }

    let dl_bar = ProgressBar::new(0);
    dl_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS),
    );
    dl_bar.set_prefix("PDF engine");
    dl_bar.enable_steady_tick(Duration::from_millis(80));

    let bar = dl_bar.clone();
    pdfium_auto::ensure_pdfium_library(Some(&move |downloaded, total| {
        if let Some(t) = total {
            if bar.length().unwrap_or(0) != t {
                bar.set_length(t);
            }
        }
        bar.set_position(downloaded);
    }))
    .context("Failed to download PDFium engine")?;

    dl_bar.finish_with_message("ready ✓");
    Ok(())
}

async fn run(cli: Cli, show_progress: bool) -> Result<()> {
    let progress = show_progress.then(CliProgressCallback::new);
    let config = build_config(
        &cli,
        progress
            .clone()
            .map(|cb| cb as Arc<dyn PipelineProgressCallback>),
    )
    .await?;

    // ── Run the pipeline, or load an existing blueprint ──────────────────
    let mut session = match (&cli.blueprint, &cli.input) {
        (Some(path), _) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read blueprint from {}", path.display()))?;
            let blueprint = parse_blueprint(&raw, &config.placeholder_title)
                .with_context(|| format!("{} is not a valid blueprint", path.display()))?;
            DocumentSession::from_blueprint(blueprint, &config)?
        }
        (None, Some(input)) => {
            let result = Pipeline::new(config).run_input(input).await;
            if let Some(ref cb) = progress {
                cb.finish();
            }
            result.context("Pipeline failed")?
        }
        (None, None) => anyhow::bail!("Nothing to do: pass an INPUT or --blueprint"),
    };

    if let Some(ref path) = cli.cleaned_out {
        write_atomic(path, session.cleaned_markdown.as_bytes())?;
        if !cli.quiet {
            eprintln!("{} cleaned text  →  {}", green("✔"), bold(&path.display().to_string()));
        }
    }

    if session.blueprint().is_none() {
        if let Some(err) = session.parse_error() {
            eprintln!("{} {}", red("✘"), bold("The model's reply was not a valid blueprint."));
            eprintln!("{}", dim(&err.raw));
        }
        let reason = session
            .into_blueprint()
            .err()
            .map(|e| e.to_string())
            .unwrap_or_default();
        anyhow::bail!("No blueprint produced: {reason}");
    }

    // ── Mutations, in order ──────────────────────────────────────────────
    let mut failed_mutations = 0usize;
    for instruction in &cli.mutations {
        match session.mutate(instruction).await {
            Ok(bp) => {
                if !cli.quiet {
                    eprintln!(
                        "{} {}  {}",
                        green("✓"),
                        truncate(instruction, 60),
                        dim(&format!("{} slides", bp.len())),
                    );
                }
            }
            Err(e) => {
                failed_mutations += 1;
                eprintln!(
                    "{} {}  {}",
                    red("✗"),
                    truncate(instruction, 60),
                    red(&format!("{e} (blueprint unchanged)")),
                );
            }
        }
    }
    if let Some(ref cb) = progress {
        cb.finish();
    }

    // ── Outputs ──────────────────────────────────────────────────────────
    let blueprint = session.into_blueprint()?;
    let json = blueprint.to_json_pretty()?;

    match cli.output {
        Some(ref path) => write_atomic(path, json.as_bytes())?,
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(json.as_bytes())
                .and_then(|_| handle.write_all(b"\n"))
                .context("Failed to write to stdout")?;
        }
    }

    if let Some(ref path) = cli.report {
        write_atomic(path, markdown_report(&blueprint).as_bytes())?;
    }

    if !cli.quiet {
        print_summary(&cli, blueprint.len(), failed_mutations, progress.as_deref());
    }
    Ok(())
}

fn print_summary(
    cli: &Cli,
    slides: usize,
    failed_mutations: usize,
    progress: Option<&CliProgressCallback>,
) {
    let unit_errors = progress.map_or(0, |p| p.errors.load(Ordering::SeqCst));
    let mark = if unit_errors == 0 && failed_mutations == 0 {
        green("✔")
    } else {
        cyan("⚠")
    };
    let target = cli
        .output
        .as_deref()
        .map(Path::display)
        .map_or_else(|| "stdout".to_string(), |d| d.to_string());
    eprintln!("{mark}  {} slides  →  {}", bold(&slides.to_string()), bold(&target));
    if unit_errors > 0 {
        eprintln!("   {}", dim(&format!("{unit_errors} page/part errors, see markers in the cleaned text")));
    }
    if failed_mutations > 0 {
        eprintln!("   {}", dim(&format!("{failed_mutations} instruction(s) not applied")));
    }
}

/// Map CLI args to `PipelineConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let style = match (&cli.style, &cli.style_file) {
        (Some(s), _) => Some(s.clone()),
        (None, Some(path)) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read style from {}", path.display()))?,
        ),
        (None, None) => None,
    };

    let local_ocr = (!cli.no_local_ocr).then(|| LocalOcrConfig {
        command: cli.tesseract.clone(),
        language: cli.ocr_lang.clone(),
        ..LocalOcrConfig::default()
    });

    let mut builder = PipelineConfig::builder()
        .dpi(cli.dpi)
        .chunk_size(cli.chunk_size)
        .inter_chunk_delay_ms(cli.chunk_delay_ms)
        .digital_text_threshold(cli.text_threshold)
        .edge_density_threshold(cli.edge_threshold)
        .local_ocr(local_ocr)
        .max_retries(cli.max_retries)
        .download_timeout_secs(cli.download_timeout)
        .api_timeout_secs(cli.api_timeout);

    if let Some(s) = style {
        builder = builder.style_instruction(s);
    }
    if let Some(ref p) = cli.provider {
        builder = builder.provider_name(p.clone());
    } else if cli.api_key.is_some() {
        builder = builder.provider_name("gemini");
    }
    if let Some(ref m) = cli.model {
        builder = builder.model(m.clone());
    }
    if let Some(ref pwd) = cli.password {
        builder = builder.password(pwd.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
