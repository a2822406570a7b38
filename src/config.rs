use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

use crate::ai_sdk::AzureOpenAiConfig;
use crate::engine::EngineConfig;
use crate::orchestrator::OrchestratorSettings;
use crate::telemetry::TelemetryConfig;

type ConfigResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[derive(Debug, Parser)]
#[command(name = "tally", version, about = "Finance SQL chat service and terminal client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the chat server
    Serve(ServeArgs),
    /// Chat with a running server from the terminal
    Chat(ChatArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    #[arg(long, env = "TALLY_LISTEN", default_value = "127.0.0.1:8787")]
    pub listen: String,

    /// Bearer token clients must present. Generated and saved when omitted.
    #[arg(long, env = "TALLY_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    #[command(flatten)]
    pub azure: AzureArgs,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Upper bound on tool-calling steps for database questions
    #[arg(
        long,
        env = "TALLY_MAX_STEPS",
        default_value_t = 3,
        value_parser = clap::value_parser!(u8).range(1..=10)
    )]
    pub max_steps: u8,

    /// Timeout applied to every model and backend call
    #[arg(long, env = "TALLY_CALL_TIMEOUT_SECS", default_value_t = 60)]
    pub call_timeout_secs: u64,

    #[arg(long, env = "TELEMETRY_URL")]
    pub telemetry_url: Option<String>,

    #[arg(long, env = "TELEMETRY_DATASET", default_value = "system_logs")]
    pub telemetry_dataset: String,

    #[arg(long, env = "TALLY_APP_NAME", default_value = "tally")]
    pub app_name: String,
}

#[derive(Debug, Clone, Args)]
pub struct AzureArgs {
    #[arg(long = "azure-endpoint", env = "AZURE_OPENAI_ENDPOINT")]
    pub endpoint: String,

    #[arg(id = "azure_api_key", long = "azure-api-key", env = "AZURE_OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: String,

    #[arg(long = "azure-api-version", env = "AZURE_OPENAI_API_VERSION", default_value = "2024-10-21")]
    pub api_version: String,

    /// Deployment used for classification and chat
    #[arg(long = "azure-deployment", env = "AZURE_OPENAI_DEPLOYMENT_NAME")]
    pub deployment: String,

    /// Deployment used for insight summaries; defaults to the chat deployment
    #[arg(long = "azure-insights-deployment", env = "AZURE_OPENAI_INSIGHTS_DEPLOYMENT")]
    pub insights_deployment: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct EngineArgs {
    #[arg(long = "engine-url", env = "API_ENGINE_URL")]
    pub engine_url: String,

    #[arg(id = "engine_api_key", long = "engine-api-key", env = "API_AUTH_KEY", hide_env_values = true)]
    pub api_key: String,

    #[arg(long = "engine-llm-name", env = "AZURE_LLM_NAME")]
    pub llm_name: Option<String>,

    #[arg(long = "engine-llm-api-base", env = "AZURE_OPENAI_API_BASE")]
    pub llm_api_base: Option<String>,

    /// Base URL of the streaming SQL generation API
    #[arg(long = "stream-api-url", env = "SQL_STREAM_API_URL")]
    pub stream_api_url: String,
}

#[derive(Debug, Clone, Args)]
pub struct ChatArgs {
    #[arg(long, env = "TALLY_URL", default_value = "http://127.0.0.1:8787")]
    pub url: String,

    #[arg(long, env = "TALLY_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Database connection the questions run against
    #[arg(long, env = "TALLY_DB_CONNECTION_ID")]
    pub db_connection_id: String,
}

impl ServeArgs {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn azure_config(&self) -> AzureOpenAiConfig {
        AzureOpenAiConfig {
            endpoint: self.azure.endpoint.clone(),
            api_key: self.azure.api_key.clone(),
            api_version: self.azure.api_version.clone(),
            timeout: self.call_timeout(),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            engine_url: self.engine.engine_url.clone(),
            api_key: self.engine.api_key.clone(),
            llm_name: self.engine.llm_name.clone(),
            llm_api_base: self.engine.llm_api_base.clone(),
            stream_api_url: self.engine.stream_api_url.clone(),
            timeout: self.call_timeout(),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            chat_model: self.azure.deployment.clone(),
            insights_model: self
                .azure
                .insights_deployment
                .clone()
                .unwrap_or_else(|| self.azure.deployment.clone()),
            max_steps: usize::from(self.max_steps),
            call_timeout: self.call_timeout(),
        }
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            url: self.telemetry_url.clone().filter(|url| !url.trim().is_empty()),
            app_name: self.app_name.clone(),
            app_id: self.app_name.clone(),
            dataset: self.telemetry_dataset.clone(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Uses the explicit token if given, else the saved one, else a new one.
/// Whatever is chosen is saved so `tally chat` can find it.
pub fn resolve_server_token(explicit: Option<String>) -> ConfigResult<String> {
    if let Some(token) = explicit {
        write_token_file(&token)?;
        return Ok(token);
    }

    if let Ok(token) = read_token_file() {
        return Ok(token);
    }

    let token = Uuid::new_v4().to_string();
    write_token_file(&token)?;
    Ok(token)
}

pub fn resolve_client_token(explicit: Option<String>) -> ConfigResult<String> {
    if let Some(token) = explicit {
        return Ok(token);
    }

    read_token_file().map_err(|_| {
        "No auth token found; pass --token, set TALLY_TOKEN, or start the server to create one."
            .into()
    })
}

fn read_token_file() -> ConfigResult<String> {
    let token = std::fs::read_to_string(token_path())?;
    let token = token.trim();
    if token.is_empty() {
        return Err("token file is empty".into());
    }
    Ok(token.to_string())
}

fn write_token_file(token: &str) -> ConfigResult<()> {
    let path = token_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&path)?;
    use std::io::Write;
    file.write_all(token.as_bytes())?;
    Ok(())
}

pub fn token_path() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        return PathBuf::from(home).join(".tally").join("server.token");
    }

    PathBuf::from("tally.token")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    const SERVE: [&str; 14] = [
        "tally",
        "serve",
        "--azure-endpoint",
        "https://example.openai.azure.com",
        "--azure-api-key",
        "secret",
        "--azure-deployment",
        "gpt-4o",
        "--engine-url",
        "http://engine",
        "--engine-api-key",
        "engine-key",
        "--stream-api-url",
        "http://stream",
    ];

    fn serve_args(extra: &[&str]) -> ServeArgs {
        let args = SERVE.iter().chain(extra.iter()).copied();
        match Cli::try_parse_from(args).unwrap().command {
            Command::Serve(args) => args,
            Command::Chat(_) => panic!("expected serve"),
        }
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn insights_deployment_defaults_to_chat_deployment() {
        let args = serve_args(&["--max-steps", "5", "--call-timeout-secs", "20"]);
        let settings = args.orchestrator_settings();
        assert_eq!(settings.chat_model, "gpt-4o");
        assert_eq!(settings.insights_model, "gpt-4o");
        assert_eq!(settings.max_steps, 5);
        assert_eq!(settings.call_timeout, Duration::from_secs(20));
        assert_eq!(args.azure_config().api_version, "2024-10-21");
        assert_eq!(args.engine_config().stream_api_url, "http://stream");
    }

    #[test]
    fn step_bound_is_range_checked() {
        let args = SERVE.iter().copied().chain(["--max-steps", "0"]);
        assert!(Cli::try_parse_from(args).is_err());
        let args = SERVE.iter().copied().chain(["--max-steps", "11"]);
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn blank_telemetry_url_disables_shipping() {
        let args = serve_args(&["--telemetry-url", " "]);
        assert!(args.telemetry_config().url.is_none());
    }

    #[test]
    fn token_lives_under_home_directory() {
        let path = token_path();
        assert!(path.ends_with("server.token") || path.ends_with("tally.token"));
    }
}
