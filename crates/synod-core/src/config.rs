use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SynodError;

/// Top-level configuration loaded from `synod.toml`.
///
/// Secrets (GitHub token, webhook secret, model API keys) are never stored
/// in the file; each section names the environment variable to read them
/// from.
///
/// # Examples
///
/// ```
/// use synod_core::SynodConfig;
///
/// let config = SynodConfig::default();
/// assert_eq!(config.models.min_agreement, 2);
/// assert_eq!(config.retry.max_attempts, 3);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynodConfig {
    /// Webhook server settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// GitHub API settings.
    #[serde(default)]
    pub github: GithubConfig,
    /// AI model panel and consensus tuning.
    #[serde(default)]
    pub models: ModelsConfig,
    /// Static analysis settings.
    #[serde(default)]
    pub analysis: AnalysisConfig,
    /// Patch generation settings.
    #[serde(default)]
    pub refactor: RefactorConfig,
    /// Sandbox and test execution settings.
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Per-stage retry and timeout policy.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl SynodConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SynodError::Io`] if the file cannot be read, or
    /// [`SynodError::Toml`] if the content is not valid TOML.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::path::Path;
    /// use synod_core::SynodConfig;
    ///
    /// let config = SynodConfig::from_file(Path::new("synod.toml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, SynodError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`SynodError::Toml`] if parsing fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use synod_core::SynodConfig;
    ///
    /// let toml = r#"
    /// [models]
    /// min_agreement = 3
    /// "#;
    /// let config = SynodConfig::from_toml(toml).unwrap();
    /// assert_eq!(config.models.min_agreement, 3);
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, SynodError> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }
}

/// Webhook server configuration.
///
/// # Examples
///
/// ```
/// use synod_core::ServerConfig;
///
/// let config = ServerConfig::default();
/// assert_eq!(config.bind_addr, "0.0.0.0:8080");
/// assert_eq!(config.workers, 4);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the webhook server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Number of pipeline workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Path to the SQLite job store.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".into()
}

fn default_workers() -> usize {
    4
}

fn default_database_path() -> PathBuf {
    PathBuf::from("synod.db")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            workers: default_workers(),
            database_path: default_database_path(),
        }
    }
}

/// GitHub API configuration.
///
/// # Examples
///
/// ```
/// use synod_core::GithubConfig;
///
/// let config = GithubConfig::default();
/// assert_eq!(config.token_env, "GITHUB_TOKEN");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    /// Inline token; prefer `token_env` so the file stays secret-free.
    pub token: Option<String>,
    /// Environment variable holding the API token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Environment variable holding the webhook HMAC secret.
    #[serde(default = "default_webhook_secret_env")]
    pub webhook_secret_env: String,
    /// Login the bot comments as, used to find its own prior comments.
    #[serde(default = "default_bot_login")]
    pub bot_login: String,
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".into()
}

fn default_webhook_secret_env() -> String {
    "SYNOD_WEBHOOK_SECRET".into()
}

fn default_bot_login() -> String {
    "synod-bot".into()
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            token: None,
            token_env: default_token_env(),
            webhook_secret_env: default_webhook_secret_env(),
            bot_login: default_bot_login(),
        }
    }
}

impl GithubConfig {
    /// Resolve the API token: inline value first, then the environment.
    pub fn resolve_token(&self) -> Option<String> {
        self.token
            .clone()
            .or_else(|| std::env::var(&self.token_env).ok())
            .filter(|t| !t.is_empty())
    }

    /// Resolve the webhook secret from the environment.
    pub fn resolve_webhook_secret(&self) -> Option<String> {
        std::env::var(&self.webhook_secret_env)
            .ok()
            .filter(|s| !s.is_empty())
    }
}

/// One AI model in the review panel.
///
/// # Examples
///
/// ```
/// use synod_core::ModelEntry;
///
/// let entry = ModelEntry::default();
/// assert_eq!(entry.name, "gpt-4o");
/// assert_eq!(entry.timeout_secs, 120);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Model identifier sent to the provider.
    #[serde(default = "default_model_name")]
    pub name: String,
    /// Base URL of an OpenAI-compatible chat completions API.
    #[serde(default = "default_model_base_url")]
    pub base_url: String,
    /// Environment variable holding the provider API key.
    #[serde(default = "default_model_api_key_env")]
    pub api_key_env: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
    /// Sampling temperature.
    #[serde(default = "default_model_temperature")]
    pub temperature: f64,
}

fn default_model_name() -> String {
    "gpt-4o".into()
}

fn default_model_base_url() -> String {
    "https://api.openai.com".into()
}

fn default_model_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}

fn default_model_timeout_secs() -> u64 {
    120
}

fn default_model_temperature() -> f64 {
    0.1
}

impl Default for ModelEntry {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            base_url: default_model_base_url(),
            api_key_env: default_model_api_key_env(),
            timeout_secs: default_model_timeout_secs(),
            temperature: default_model_temperature(),
        }
    }
}

/// Model panel and consensus tuning.
///
/// # Examples
///
/// ```
/// use synod_core::ModelsConfig;
///
/// let config = ModelsConfig::default();
/// assert_eq!(config.entries.len(), 1);
/// assert_eq!(config.similarity_threshold, 0.5);
/// assert_eq!(config.max_findings, 20);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// The review panel; each entry is queried concurrently.
    #[serde(default = "default_model_entries")]
    pub entries: Vec<ModelEntry>,
    /// Message similarity threshold for clustering findings (0.0–1.0).
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Minimum agreeing models for an error finding to block the PR.
    #[serde(default = "default_min_agreement")]
    pub min_agreement: usize,
    /// Minimum responding models required to form a consensus at all.
    #[serde(default = "default_min_responders")]
    pub min_responders: usize,
    /// Cap on consensus findings surfaced to the PR.
    #[serde(default = "default_max_findings")]
    pub max_findings: usize,
}

fn default_model_entries() -> Vec<ModelEntry> {
    vec![ModelEntry::default()]
}

fn default_similarity_threshold() -> f64 {
    0.5
}

fn default_min_agreement() -> usize {
    2
}

fn default_min_responders() -> usize {
    1
}

fn default_max_findings() -> usize {
    20
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            entries: default_model_entries(),
            similarity_threshold: default_similarity_threshold(),
            min_agreement: default_min_agreement(),
            min_responders: default_min_responders(),
            max_findings: default_max_findings(),
        }
    }
}

/// Static analysis configuration.
///
/// # Examples
///
/// ```
/// use synod_core::AnalysisConfig;
///
/// let config = AnalysisConfig::default();
/// assert!(config.enabled);
/// assert_eq!(config.tool_timeout_secs, 120);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Run static analyzers at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Glob patterns for files to skip.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Per-tool invocation timeout in seconds.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_tool_timeout_secs() -> u64 {
    120
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exclude: Vec::new(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

/// Patch generation configuration.
///
/// # Examples
///
/// ```
/// use synod_core::RefactorConfig;
///
/// let config = RefactorConfig::default();
/// assert!(config.enabled);
/// assert_eq!(config.max_patches, 5);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefactorConfig {
    /// Generate candidate patches for fixable findings.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Cap on patches generated per job (most severe first).
    #[serde(default = "default_max_patches")]
    pub max_patches: usize,
    /// Model used for generation; defaults to the first panel entry.
    pub model: Option<String>,
}

fn default_max_patches() -> usize {
    5
}

impl Default for RefactorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_patches: default_max_patches(),
            model: None,
        }
    }
}

/// Sandbox and test execution configuration.
///
/// # Examples
///
/// ```
/// use synod_core::SandboxConfig;
///
/// let config = SandboxConfig::default();
/// assert_eq!(config.test_timeout_secs, 300);
/// assert!(config.copy_ignore.contains(&".git".to_string()));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Wall-clock timeout for one test run, in seconds.
    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,
    /// Override for the detected test command.
    pub test_command: Option<String>,
    /// Directory names skipped when copying a local tree into a sandbox.
    #[serde(default = "default_copy_ignore")]
    pub copy_ignore: Vec<String>,
}

fn default_test_timeout_secs() -> u64 {
    300
}

fn default_copy_ignore() -> Vec<String> {
    vec![
        ".git".into(),
        "target".into(),
        "node_modules".into(),
        "__pycache__".into(),
    ]
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            test_timeout_secs: default_test_timeout_secs(),
            test_command: None,
            copy_ignore: default_copy_ignore(),
        }
    }
}

/// Per-stage retry and timeout policy.
///
/// Backoff between attempts is `backoff_base_secs * 2^(attempt - 1)`.
///
/// # Examples
///
/// ```
/// use synod_core::RetryConfig;
///
/// let config = RetryConfig::default();
/// assert_eq!(config.backoff_delay_secs(1), 60);
/// assert_eq!(config.backoff_delay_secs(2), 120);
/// assert_eq!(config.backoff_delay_secs(3), 240);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per stage.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for exponential backoff, in seconds.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    /// Hard wall-clock timeout for one stage attempt, in seconds.
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_secs() -> u64 {
    60
}

fn default_stage_timeout_secs() -> u64 {
    600
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            stage_timeout_secs: default_stage_timeout_secs(),
        }
    }
}

impl RetryConfig {
    /// Delay before the attempt after `attempt` (1-based) failures.
    pub fn backoff_delay_secs(&self, attempt: u32) -> u64 {
        self.backoff_base_secs
            .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16))
    }
}
