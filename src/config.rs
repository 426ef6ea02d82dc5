use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::path::PathBuf;

/// Pickup booking API client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the booking API
    #[arg(short = 'u', long, env = "PICKUP_API_URL")]
    pub api_url: String,

    /// Refresh endpoint path, relative to the API URL
    #[arg(long, env = "PICKUP_REFRESH_PATH", default_value = "/auth/refresh")]
    pub refresh_path: String,

    /// Path to the session database
    #[arg(short = 'd', long, env = "PICKUP_SESSION_DB")]
    pub session_db: Option<String>,

    /// Keep the session in memory only
    #[arg(long, env = "PICKUP_EPHEMERAL")]
    pub ephemeral: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "10")]
    pub connect_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// Idle connections kept per host
    #[arg(long, env = "HTTP_MAX_CONNECTIONS", default_value = "20")]
    pub max_connections: usize,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Store the token pair issued by the login flow
    Login {
        #[arg(long)]
        access_token: Option<String>,
        #[arg(long)]
        refresh_token: Option<String>,
    },
    /// Forget the stored session
    Logout,
    /// Show session state
    Status,
    /// Dismiss the "session expired" state
    Acknowledge,
    /// Send an authenticated request
    Request {
        /// HTTP method (GET, POST, ...)
        method: String,
        /// Path relative to the API URL
        path: String,
        /// JSON body
        #[arg(long)]
        data: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub api_base_url: Url,
    pub refresh_path: String,

    /// `None` keeps the session in memory
    pub session_db: Option<PathBuf>,

    pub log_level: String,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
}

impl Config {
    /// Load configuration with priority: CLI > ENV > .env > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        Self::from_args(args)
    }

    pub fn from_args(args: CliArgs) -> Result<(Self, Command)> {
        let api_base_url = Url::parse(&args.api_url)
            .with_context(|| format!("PICKUP_API_URL is not a valid URL: {}", args.api_url))?;

        let session_db = if args.ephemeral {
            None
        } else {
            Some(
                args.session_db
                    .map(|s| expand_tilde(&s))
                    .unwrap_or_else(default_session_db),
            )
        };

        let config = Config {
            api_base_url,
            refresh_path: args.refresh_path,
            session_db,
            log_level: args.log_level,
            http_max_connections: args.max_connections,
            http_connect_timeout: args.connect_timeout,
            http_request_timeout: args.http_timeout,
        };

        Ok((config, args.command))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.api_base_url.scheme() {
            "http" | "https" => {}
            other => anyhow::bail!("PICKUP_API_URL must be http or https, got '{}'", other),
        }

        if self.http_request_timeout == 0 {
            anyhow::bail!("HTTP_REQUEST_TIMEOUT must be greater than zero");
        }

        self.refresh_url()?;
        Ok(())
    }

    /// Absolute URL of the refresh endpoint
    pub fn refresh_url(&self) -> Result<Url> {
        crate::request::resolve_url(&self.api_base_url, &self.refresh_path)
            .with_context(|| format!("Invalid refresh path: {}", self.refresh_path))
    }
}

/// Default session database location (`~/.pickup-client/session.db`)
fn default_session_db() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".pickup-client").join("session.db"))
        .unwrap_or_else(|| PathBuf::from("session.db"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> (Config, Command) {
        let mut argv = vec!["pickup-client"];
        argv.extend_from_slice(args);
        Config::from_args(CliArgs::try_parse_from(argv).unwrap()).unwrap()
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(path.to_string_lossy().contains("test/file.txt"));
        assert!(!path.to_string_lossy().starts_with("~"));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_just_tilde() {
        // Just "~" without slash should not expand
        let path = expand_tilde("~");
        assert_eq!(path, PathBuf::from("~"));
    }

    #[test]
    fn test_defaults() {
        let (config, command) = parse(&["-u", "https://api.example.com", "--session-db", "/tmp/s.db", "status"]);

        assert_eq!(command, Command::Status);
        assert_eq!(config.refresh_path, "/auth/refresh");
        assert_eq!(config.session_db, Some(PathBuf::from("/tmp/s.db")));
        assert_eq!(config.http_max_connections, 20);
        config.validate().unwrap();
        assert_eq!(
            config.refresh_url().unwrap().as_str(),
            "https://api.example.com/auth/refresh"
        );
    }

    #[test]
    fn test_ephemeral_has_no_session_db() {
        let (config, _) = parse(&["-u", "http://localhost:8080/api", "--ephemeral", "logout"]);
        assert!(config.session_db.is_none());
        assert_eq!(
            config.refresh_url().unwrap().as_str(),
            "http://localhost:8080/api/auth/refresh"
        );
    }

    #[test]
    fn test_request_command() {
        let (_, command) = parse(&[
            "-u",
            "http://localhost",
            "request",
            "POST",
            "/orders",
            "--data",
            r#"{"bins":2}"#,
        ]);
        assert_eq!(
            command,
            Command::Request {
                method: "POST".to_string(),
                path: "/orders".to_string(),
                data: Some(r#"{"bins":2}"#.to_string()),
            }
        );
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let args = CliArgs::try_parse_from(["pickup-client", "-u", "not a url", "status"]).unwrap();
        assert!(Config::from_args(args).is_err());
    }

    #[test]
    fn test_non_http_scheme_fails_validation() {
        let (config, _) = parse(&["-u", "ftp://files.example.com", "--ephemeral", "status"]);
        assert!(config.validate().is_err());
    }
}
