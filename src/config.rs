//! Environment-driven configuration, loaded once at startup.

use std::path::PathBuf;

use clap::Parser;

/// Command-line overrides for the environment-derived configuration.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// LLM provider API key (overrides ANTHROPIC_API_KEY).
    #[arg(long)]
    pub llm_api_key: Option<String>,

    /// Directory staged uploads are written to (overrides UPLOAD_DIR).
    #[arg(long)]
    pub upload_dir: Option<PathBuf>,

    /// Directory converted NWB artifacts are written to (overrides OUTPUT_DIR).
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Directory rendered reports are written to (overrides REPORT_DIR).
    #[arg(long)]
    pub report_dir: Option<PathBuf>,

    /// Directory per-session logs are written to (overrides LOG_DIR).
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Hard upload size ceiling in gigabytes (overrides MAX_UPLOAD_SIZE_GB).
    #[arg(long)]
    pub max_upload_size_gb: Option<u64>,
}

/// Resolved configuration for one run of the orchestrator.
#[derive(Debug, Clone)]
pub struct Config {
    pub llm_api_key: String,
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    pub report_dir: PathBuf,
    pub log_dir: PathBuf,
    pub max_upload_size_gb: u64,
}

/// Raised when a required configuration value has no env var and no
/// CLI override. The LLM provider key is the only value without a default.
#[derive(Debug, Clone, thiserror::Error)]
#[error("missing required configuration: {0}")]
pub struct ConfigError(pub &'static str);

impl Config {
    /// Build the configuration from environment variables, then apply any
    /// CLI overrides. The LLM key is required with no default; every other
    /// value falls back to the defaults named in the external interfaces.
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let llm_api_key = args
            .llm_api_key
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .ok_or(ConfigError("ANTHROPIC_API_KEY"))?;

        let upload_dir = args
            .upload_dir
            .clone()
            .or_else(|| std::env::var("UPLOAD_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./uploads"));

        let output_dir = args
            .output_dir
            .clone()
            .or_else(|| std::env::var("OUTPUT_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./outputs"));

        let report_dir = args
            .report_dir
            .clone()
            .or_else(|| std::env::var("REPORT_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./reports"));

        let log_dir = args
            .log_dir
            .clone()
            .or_else(|| std::env::var("LOG_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./logs"));

        let max_upload_size_gb = args
            .max_upload_size_gb
            .or_else(|| {
                std::env::var("MAX_UPLOAD_SIZE_GB")
                    .ok()
                    .and_then(|v| v.parse().ok())
            })
            .unwrap_or(50);

        Ok(Self {
            llm_api_key,
            upload_dir,
            output_dir,
            report_dir,
            log_dir,
            max_upload_size_gb,
        })
    }

    /// Create the four partitioned filesystem areas if they don't exist yet.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.upload_dir)?;
        std::fs::create_dir_all(&self.output_dir)?;
        std::fs::create_dir_all(&self.report_dir)?;
        std::fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_args() -> Args {
        Args {
            llm_api_key: None,
            upload_dir: None,
            output_dir: None,
            report_dir: None,
            log_dir: None,
            max_upload_size_gb: None,
        }
    }

    #[test]
    fn missing_api_key_without_env_is_an_error() {
        // SAFETY: tests run single-threaded within this process for env state.
        std::env::remove_var("ANTHROPIC_API_KEY");
        let err = Config::load(&empty_args()).unwrap_err();
        assert_eq!(err.0, "ANTHROPIC_API_KEY");
    }

    #[test]
    fn cli_override_wins_over_missing_env() {
        std::env::remove_var("ANTHROPIC_API_KEY");
        let mut args = empty_args();
        args.llm_api_key = Some("sk-test".to_string());
        let config = Config::load(&args).unwrap();
        assert_eq!(config.llm_api_key, "sk-test");
        assert_eq!(config.max_upload_size_gb, 50);
        assert_eq!(config.upload_dir, PathBuf::from("./uploads"));
    }
}
