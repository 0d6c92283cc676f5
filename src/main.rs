use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use miette::{IntoDiagnostic, Result, WrapErr};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use synod_core::{
    ChangedFile, Patch, PatchValidation, ReviewJob, ReviewRequest, Severity, SourceFile,
    SynodConfig, SynodError,
};
use synod_github::{parse_pr_reference, GitHubClient};
use synod_patch::Workspace;
use synod_server::{
    run_workers, serve, AppState, GithubGateway, JobStore, Orchestrator, ReviewGateway, Scheduler,
};

#[derive(Parser)]
#[command(
    name = "synod",
    version,
    about = "Multi-model AI pull request reviews with consensus verdicts",
    long_about = "Synod reviews pull requests with a panel of AI models — a finding only \n\
                   carries weight when independent reviewers agree on it.\n\n\
                   Runs as a GitHub webhook service or as a one-shot CLI review. Combines\n\
                   static analysis with multi-model consensus, generates candidate fixes,\n\
                   and validates them against the project test suite before proposing them.\n\n\
                   Examples:\n  \
                     synod serve                        Run the webhook review service\n  \
                     synod review --pr owner/repo#42    Review one PR from the terminal\n  \
                     synod review --pr owner/repo#42 --post   Also publish the results\n  \
                     synod jobs                         Show recent review jobs\n  \
                     synod doctor                       Check setup and environment"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (default: synod.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    verbose: bool,

    /// When to use colors
    #[arg(long, global = true, default_value = "auto")]
    color: ColorChoice,
}

#[derive(Subcommand)]
enum Command {
    /// Run the webhook review service
    #[command(long_about = "Run the webhook review service.\n\n\
        Listens for GitHub pull_request events, deduplicates them into review jobs,\n\
        and drives each job through analysis, multi-model review, patch generation,\n\
        sandbox validation, and commenting. Interrupted jobs are recovered on start.\n\n\
        Examples:\n  synod serve\n  synod serve --bind 127.0.0.1:9000")]
    Serve {
        /// Bind address, overriding the configured one
        #[arg(long)]
        bind: Option<String>,
    },
    /// Review one pull request from the terminal
    #[command(long_about = "Review one pull request from the terminal.\n\n\
        Runs the full pipeline once for the given PR and prints the review comment\n\
        to stdout. Nothing is published unless --post is given.\n\n\
        Examples:\n  synod review --pr owner/repo#42\n  synod review --pr owner/repo#42 --post\n  synod review --pr owner/repo#42 --fail-on warning")]
    Review {
        /// Pull request to review (format: owner/repo#123)
        #[arg(
            long,
            long_help = "Pull request to review.\n\nFormat: owner/repo#123\nRequires a GitHub token (see [github] in synod.toml)."
        )]
        pr: String,
        /// Publish the comment, check run, and fix PR to GitHub
        #[arg(long)]
        post: bool,
        /// Exit non-zero if consensus findings meet this severity
        #[arg(
            long,
            value_parser = parse_severity,
            long_help = "Exit with a non-zero code if any consensus finding has this severity or higher.\n\nSeverity ranking: error > warning > info.\nUseful in CI pipelines."
        )]
        fail_on: Option<Severity>,
    },
    /// Show recent review jobs from the job store
    #[command(long_about = "Show recent review jobs from the job store.\n\n\
        Reads the SQLite store the service persists jobs to. Use --format json\n\
        for the full job records.\n\n\
        Examples:\n  synod jobs\n  synod jobs --limit 5 --format json")]
    Jobs {
        /// Maximum jobs to show (default: 20)
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Create a default synod.toml configuration file
    #[command(long_about = "Create a default synod.toml configuration file.\n\n\
        Generates a commented-out template with all available options.\n\
        Fails if synod.toml already exists.")]
    Init,
    /// Check your Synod setup and environment
    #[command(long_about = "Check your Synod setup and environment.\n\n\
        Runs diagnostics for the config file, GitHub token, webhook secret,\n\
        model API keys, lint tools, and the job store. Use --format json for\n\
        machine-readable output.")]
    Doctor,
    /// Generate shell completion scripts
    #[command(hide = true)]
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable tables and summaries (default)
    Text,
    /// Machine-readable JSON
    Json,
}

#[derive(Clone, PartialEq, Eq, ValueEnum)]
enum ColorChoice {
    /// Auto-detect based on terminal
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

fn parse_severity(s: &str) -> std::result::Result<Severity, String> {
    s.parse()
}

fn print_welcome(use_color: bool) {
    let version = env!("CARGO_PKG_VERSION");

    if use_color {
        println!("\x1b[1m\x1b[33m⚖\x1b[0m \x1b[1msynod\x1b[0m v{version} — PR reviews that need a second opinion to count\n");

        println!("Quick start:");
        println!("  \x1b[36msynod init\x1b[0m                       Create a synod.toml config file");
        println!("  \x1b[36msynod review --pr owner/repo#1\x1b[0m  Review a pull request once");
        println!("  \x1b[36msynod serve\x1b[0m                      Run the webhook review service\n");

        println!("All commands:");
        println!("  \x1b[32mserve\x1b[0m    Webhook service: review every PR as it changes");
        println!("  \x1b[32mreview\x1b[0m   One-shot review of a single pull request");
        println!("  \x1b[32mjobs\x1b[0m     Show recent review jobs and their outcomes");
        println!("  \x1b[32mdoctor\x1b[0m   Check your setup and environment");
        println!("  \x1b[32minit\x1b[0m     Create default configuration\n");
    } else {
        println!("synod v{version} — PR reviews that need a second opinion to count\n");

        println!("Quick start:");
        println!("  synod init                       Create a synod.toml config file");
        println!("  synod review --pr owner/repo#1   Review a pull request once");
        println!("  synod serve                      Run the webhook review service\n");

        println!("All commands:");
        println!("  serve    Webhook service: review every PR as it changes");
        println!("  review   One-shot review of a single pull request");
        println!("  jobs     Show recent review jobs and their outcomes");
        println!("  doctor   Check your setup and environment");
        println!("  init     Create default configuration\n");
    }

    println!("Run 'synod <command> --help' for details.");
}

/// Gateway for one-shot reviews: reads from GitHub like the live gateway,
/// but prints the review to stdout instead of publishing, unless --post.
struct OneShotGateway {
    inner: GithubGateway,
    post: bool,
}

#[async_trait]
impl ReviewGateway for OneShotGateway {
    async fn changed_files(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> std::result::Result<Vec<ChangedFile>, SynodError> {
        self.inner.changed_files(owner, repo, number).await
    }

    async fn hydrate(
        &self,
        request: &ReviewRequest,
    ) -> std::result::Result<Vec<SourceFile>, SynodError> {
        self.inner.hydrate(request).await
    }

    async fn prepare_workspace(
        &self,
        request: &ReviewRequest,
    ) -> std::result::Result<Workspace, SynodError> {
        self.inner.prepare_workspace(request).await
    }

    async fn publish_comment(
        &self,
        request: &ReviewRequest,
        marker: &str,
        body: &str,
    ) -> std::result::Result<bool, SynodError> {
        if self.post {
            return self.inner.publish_comment(request, marker, body).await;
        }
        println!("{body}");
        Ok(false)
    }

    async fn publish_check(
        &self,
        request: &ReviewRequest,
        conclusion: &str,
        summary: &str,
    ) -> std::result::Result<(), SynodError> {
        if self.post {
            return self.inner.publish_check(request, conclusion, summary).await;
        }
        Ok(())
    }

    async fn open_fix_pr(
        &self,
        request: &ReviewRequest,
        patches: &[Patch],
    ) -> std::result::Result<String, SynodError> {
        if self.post {
            return self.inner.open_fix_pr(request, patches).await;
        }
        for patch in patches {
            if patch.validation == PatchValidation::Passed {
                println!("--- validated fix ({}) ---\n{}", patch.id, patch.diff);
            }
        }
        Err(SynodError::Github(
            "fix PR not opened (pass --post to publish)".into(),
        ))
    }
}

#[derive(serde::Serialize)]
struct CheckResult {
    name: &'static str,
    status: &'static str,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
}

impl CheckResult {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: "pass",
            detail: detail.into(),
            hint: None,
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            name,
            status: "fail",
            detail: detail.into(),
            hint: Some(hint.into()),
        }
    }

    fn info(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: "info",
            detail: detail.into(),
            hint: None,
        }
    }

    fn symbol(&self) -> &'static str {
        match self.status {
            "pass" => "\u{2713}",
            "fail" => "\u{2717}",
            _ => "~",
        }
    }

    fn colored_symbol(&self) -> String {
        match self.status {
            "pass" => "\x1b[32m\u{2713}\x1b[0m".into(),
            "fail" => "\x1b[31m\u{2717}\x1b[0m".into(),
            _ => "\x1b[33m~\x1b[0m".into(),
        }
    }
}

fn find_in_path(binary: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file())
}

fn run_doctor(config: &SynodConfig, format: OutputFormat, use_color: bool) -> Result<()> {
    let mut checks: Vec<CheckResult> = Vec::new();

    // 1. Config file
    let config_path = std::path::Path::new("synod.toml");
    if config_path.exists() {
        checks.push(CheckResult::pass(
            "config_file",
            format!("synod.toml found ({} panel models)", config.models.entries.len()),
        ));
    } else {
        checks.push(CheckResult::fail(
            "config_file",
            "synod.toml not found",
            "run 'synod init' to create a default config",
        ));
    }

    // 2. GitHub token
    if config.github.resolve_token().is_some() {
        checks.push(CheckResult::pass(
            "github_token",
            format!("{} set", config.github.token_env),
        ));
    } else {
        checks.push(CheckResult::fail(
            "github_token",
            format!("{} not set", config.github.token_env),
            format!("export {}=... (needed for all GitHub access)", config.github.token_env),
        ));
    }

    // 3. Webhook secret
    if config.github.resolve_webhook_secret().is_some() {
        checks.push(CheckResult::pass(
            "webhook_secret",
            format!("{} set", config.github.webhook_secret_env),
        ));
    } else {
        checks.push(CheckResult::info(
            "webhook_secret",
            format!(
                "{} not set (serve accepts unsigned deliveries)",
                config.github.webhook_secret_env
            ),
        ));
    }

    // 4. Model panel API keys
    checks.push(CheckResult::pass(
        "model_panel",
        format!(
            "{} models, min agreement {}",
            config.models.entries.len(),
            config.models.min_agreement
        ),
    ));
    let missing_keys: Vec<&str> = config
        .models
        .entries
        .iter()
        .map(|e| e.api_key_env.as_str())
        .filter(|env| std::env::var(env).map_or(true, |v| v.is_empty()))
        .collect();
    if missing_keys.is_empty() {
        checks.push(CheckResult::pass("model_api_keys", "all panel keys set"));
    } else {
        checks.push(CheckResult::fail(
            "model_api_keys",
            format!("missing: {}", missing_keys.join(", ")),
            "export the listed variables, or point base_url at a keyless endpoint",
        ));
    }

    // 5. Lint tools
    for tool in ["pylint", "eslint"] {
        if find_in_path(tool) {
            checks.push(CheckResult::pass("lint_tools", format!("{tool} found")));
        } else {
            checks.push(CheckResult::info(
                "lint_tools",
                format!("{tool} not found (its findings will be skipped)"),
            ));
        }
    }

    // 6. Job store
    let db_path = &config.server.database_path;
    if db_path.exists() {
        let detail = match rusqlite::Connection::open_with_flags(
            db_path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        ) {
            Ok(conn) => {
                let count: i64 = conn
                    .query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))
                    .unwrap_or(0);
                format!("{} ({count} jobs recorded)", db_path.display())
            }
            Err(_) => db_path.display().to_string(),
        };
        checks.push(CheckResult::pass("job_store", detail));
    } else {
        checks.push(CheckResult::info(
            "job_store",
            format!("{} not found (created on first run)", db_path.display()),
        ));
    }

    // Output
    match format {
        OutputFormat::Json => {
            let version = env!("CARGO_PKG_VERSION");
            let json = serde_json::json!({
                "version": version,
                "checks": checks,
            });
            println!("{}", serde_json::to_string_pretty(&json).into_diagnostic()?);
        }
        OutputFormat::Text => {
            let version = env!("CARGO_PKG_VERSION");
            println!("Synod v{version} — Environment Check\n");

            for check in &checks {
                let sym = if use_color {
                    check.colored_symbol()
                } else {
                    check.symbol().to_string()
                };
                let label = check.name.replace('_', " ");
                println!("  {sym} {label:<20} {}", check.detail);
                if let Some(hint) = &check.hint {
                    println!("    hint: {hint}");
                }
            }

            let passed = checks.iter().filter(|c| c.status == "pass").count();
            let failed = checks.iter().filter(|c| c.status == "fail").count();
            let info = checks.iter().filter(|c| c.status == "info").count();
            println!("\n{passed} checks passed, {failed} failed, {info} info");
        }
    }

    Ok(())
}

const DEFAULT_CONFIG: &str = r#"# Synod Configuration
# See: https://github.com/synod-dev/synod

[server]
# bind_addr = "0.0.0.0:8080"
# workers = 4
# database_path = "synod.db"

[github]
# token_env = "GITHUB_TOKEN"
# webhook_secret_env = "SYNOD_WEBHOOK_SECRET"
# bot_login = "synod-bot"

[models]
# similarity_threshold = 0.5
# min_agreement = 2
# min_responders = 1
# max_findings = 20

# The review panel. Add one block per model; each is queried concurrently.
# [[models.entries]]
# name = "gpt-4o"
# base_url = "https://api.openai.com"
# api_key_env = "OPENAI_API_KEY"
# timeout_secs = 120
# temperature = 0.2

[analysis]
# enabled = true
# exclude = ["*.min.js", "vendor/**"]
# tool_timeout_secs = 120

[refactor]
# enabled = true
# max_patches = 5
# model = "gpt-4o"

[sandbox]
# test_timeout_secs = 300
# test_command = "pytest -q"

[retry]
# max_attempts = 3
# backoff_base_secs = 60
# stage_timeout_secs = 600
"#;

fn init_tracing(verbose: bool, default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { default_level })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<SynodConfig> {
    match &cli.config {
        Some(path) => SynodConfig::from_file(path)
            .into_diagnostic()
            .wrap_err(format!("loading {}", path.display())),
        None => {
            let default_path = std::path::Path::new("synod.toml");
            if default_path.exists() {
                SynodConfig::from_file(default_path)
                    .into_diagnostic()
                    .wrap_err("loading synod.toml")
            } else {
                Ok(SynodConfig::default())
            }
        }
    }
}

fn github_client(config: &SynodConfig) -> Result<GitHubClient> {
    let Some(token) = config.github.resolve_token() else {
        miette::bail!(miette::miette!(
            help = format!(
                "export {}=... or set token in synod.toml under [github]",
                config.github.token_env
            ),
            "No GitHub token configured"
        ));
    };
    GitHubClient::new(Some(&token)).into_diagnostic()
}

async fn run_serve(config: SynodConfig, bind: Option<String>) -> Result<()> {
    let store = JobStore::open(&config.server.database_path).into_diagnostic()?;
    let client = github_client(&config)?;
    let gateway: Arc<dyn ReviewGateway> = Arc::new(GithubGateway::new(client));

    let (queue_tx, queue_rx) = mpsc::channel(256);
    let scheduler = Arc::new(Scheduler::new(store.clone(), queue_tx));
    let orchestrator = Arc::new(
        Orchestrator::new(config.clone(), store.clone(), Arc::clone(&gateway)).into_diagnostic()?,
    );

    // Put jobs interrupted by the last shutdown back on the queue.
    for id in store.recover().into_diagnostic()? {
        scheduler.enqueue(id).await.into_diagnostic()?;
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("shutting down, draining in-flight jobs...");
                shutdown.cancel();
            }
        });
    }

    let workers = tokio::spawn(run_workers(
        orchestrator,
        Arc::clone(&scheduler),
        queue_rx,
        config.server.workers,
        shutdown.clone(),
    ));

    let state = Arc::new(AppState {
        scheduler,
        gateway,
        webhook_secret: config.github.resolve_webhook_secret(),
    });
    let bind_addr = bind.unwrap_or_else(|| config.server.bind_addr.clone());
    serve(state, &bind_addr, shutdown.clone()).await.into_diagnostic()?;

    workers.await.into_diagnostic()?;
    Ok(())
}

async fn run_review(
    config: SynodConfig,
    pr: &str,
    post: bool,
    fail_on: Option<Severity>,
) -> Result<()> {
    let (owner, repo, number) = parse_pr_reference(pr).into_diagnostic()?;
    let client = github_client(&config)?;
    let request = client
        .build_review_request(&owner, &repo, number)
        .await
        .into_diagnostic()
        .wrap_err(format!("fetching {pr}"))?;

    let store = JobStore::in_memory().into_diagnostic()?;
    let gateway = Arc::new(OneShotGateway {
        inner: GithubGateway::new(client),
        post,
    });
    let orchestrator = Orchestrator::new(config, store.clone(), gateway).into_diagnostic()?;

    let job = ReviewJob::new(request);
    let job_id = job.id.clone();
    store.save(&job).into_diagnostic()?;

    let is_tty = std::io::stderr().is_terminal();
    let spinner = if is_tty {
        let pb = indicatif::ProgressBar::new_spinner();
        pb.set_style(
            indicatif::ProgressStyle::with_template("{spinner:.cyan} {msg} ({elapsed})")
                .unwrap(),
        );
        pb.set_message(format!("Reviewing {pr}..."));
        pb.enable_steady_tick(std::time::Duration::from_millis(120));
        Some(pb)
    } else {
        None
    };

    let status = orchestrator
        .run(&job_id, CancellationToken::new())
        .await
        .inspect_err(|_e| {
            if let Some(pb) = &spinner {
                pb.finish_with_message("Failed");
            }
        })
        .into_diagnostic()?;
    if let Some(pb) = spinner {
        pb.finish_with_message(format!("Done ({status})"));
    }

    let job = store
        .load(&job_id)
        .into_diagnostic()?
        .ok_or_else(|| miette::miette!("job vanished from the in-memory store"))?;

    if let Some(consensus) = &job.consensus {
        eprintln!(
            "{} findings from {}/{} models, verdict {}",
            consensus.findings.len(),
            consensus.models_responded,
            consensus.models_queried,
            consensus.verdict,
        );
    } else {
        eprintln!("AI review unavailable; results are from static analysis only");
    }

    if let Some(threshold) = fail_on {
        let findings: Box<dyn Iterator<Item = Severity>> = match &job.consensus {
            Some(consensus) => Box::new(consensus.findings.iter().map(|f| f.severity)),
            None => Box::new(job.findings.iter().map(|f| f.severity)),
        };
        let mut findings = findings;
        if findings.any(|s| s.meets_threshold(threshold)) {
            std::process::exit(1);
        }
    }
    Ok(())
}

fn run_jobs(config: &SynodConfig, limit: usize, format: OutputFormat) -> Result<()> {
    if !config.server.database_path.exists() {
        miette::bail!(miette::miette!(
            help = "the store is created when 'synod serve' processes its first job",
            "Job store not found at {}",
            config.server.database_path.display()
        ));
    }
    let store = JobStore::open(&config.server.database_path).into_diagnostic()?;
    let jobs = store.recent(limit).into_diagnostic()?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&jobs).into_diagnostic()?);
        }
        OutputFormat::Text => {
            if jobs.is_empty() {
                println!("No jobs recorded.");
                return Ok(());
            }
            for job in &jobs {
                let verdict = job
                    .result
                    .as_ref()
                    .map(|r| r.verdict.to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{}  {:<24} {:<11} verdict={:<15} {}",
                    job.updated_at.format("%Y-%m-%d %H:%M:%S"),
                    job.request.pr_key(),
                    job.status.to_string(),
                    verdict,
                    job.id,
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .build(),
        )
    }))
    .expect("miette handler");
    human_panic::setup_panic!();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let use_color = match cli.color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => std::io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err(),
    };

    match cli.command {
        None => {
            print_welcome(use_color);
        }
        Some(Command::Serve { bind }) => {
            init_tracing(cli.verbose, "info");
            run_serve(config, bind).await?;
        }
        Some(Command::Review { ref pr, post, fail_on }) => {
            init_tracing(cli.verbose, "warn");
            run_review(config, pr, post, fail_on).await?;
        }
        Some(Command::Jobs { limit }) => {
            run_jobs(&config, limit, cli.format)?;
        }
        Some(Command::Init) => {
            let path = std::path::Path::new("synod.toml");
            if path.exists() {
                miette::bail!("synod.toml already exists");
            }
            std::fs::write(path, DEFAULT_CONFIG).into_diagnostic()?;
            println!("Created synod.toml with default configuration");
        }
        Some(Command::Doctor) => {
            run_doctor(&config, cli.format, use_color)?;
        }
        Some(Command::Completions { shell }) => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "synod", &mut std::io::stdout());
        }
    }

    Ok(())
}
