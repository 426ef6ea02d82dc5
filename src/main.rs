use anyhow::{Context, Result};
use dialoguer::Password;
use reqwest::Method;
use std::sync::Arc;

use pickup_client::auth::{SqliteTokenStorage, TokenStorage};
use pickup_client::config::{Command, Config};
use pickup_client::{AuthHttpClient, TokenPair, TokenStore};

#[tokio::main]
async fn main() -> Result<()> {
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!(api = %config.api_base_url, "Configuration loaded");

    let store = Arc::new(open_store(&config)?);
    let client = AuthHttpClient::from_config(&config, store.clone())?;

    match command {
        Command::Login {
            access_token,
            refresh_token,
        } => {
            let access = match access_token {
                Some(token) => token,
                None => prompt_secret("Access token")?,
            };
            let refresh = match refresh_token {
                Some(token) => token,
                None => prompt_secret("Refresh token")?,
            };
            if access.is_empty() || refresh.is_empty() {
                anyhow::bail!("Both access and refresh token are required");
            }
            client.login(TokenPair::new(access, refresh));
            println!("Session stored");
        }
        Command::Logout => {
            client.logout();
            println!("Signed out");
        }
        Command::Status => print_status(&store),
        Command::Acknowledge => {
            store.acknowledge_session_expired();
            print_status(&store);
        }
        Command::Request { method, path, data } => {
            let method = Method::from_bytes(method.to_uppercase().as_bytes())
                .with_context(|| format!("Invalid HTTP method: {}", method))?;
            let mut request = client.request(method, &path)?;
            if let Some(data) = data {
                let body: serde_json::Value =
                    serde_json::from_str(&data).context("--data must be valid JSON")?;
                request = request.json(&body)?;
            }

            match client.send(request).await {
                Ok(response) => {
                    eprintln!("{}", response.status());
                    println!("{}", response.text());
                }
                Err(e) => {
                    if e.requires_login() {
                        eprintln!("Your session has expired. Please sign in again with `pickup-client login`.");
                    }
                    return Err(e.into());
                }
            }
        }
    }

    Ok(())
}

fn open_store(config: &Config) -> Result<TokenStore> {
    match &config.session_db {
        Some(path) => {
            tracing::debug!("Opening session database: {}", path.display());
            let storage: Arc<dyn TokenStorage> = Arc::new(SqliteTokenStorage::open(path)?);
            TokenStore::open(storage)
        }
        None => Ok(TokenStore::in_memory()),
    }
}

fn prompt_secret(prompt: &str) -> Result<String> {
    Password::new()
        .with_prompt(prompt)
        .interact()
        .with_context(|| format!("Failed to read {}", prompt.to_lowercase()))
}

fn print_status(store: &TokenStore) {
    match store.access_token() {
        Some(token) => println!("Signed in (access token {})", token),
        None => println!("Not signed in"),
    }
    if store.is_session_expired() {
        println!("Session expired: sign in again or run `pickup-client acknowledge`");
    }
}
