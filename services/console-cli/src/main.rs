//! Pentest console command-line client
//!
//! Thin surface over `console-client`:
//! 1. Resolves and loads the TOML config
//! 2. Opens the credential store (file-backed when configured)
//! 3. Runs one subcommand, printing JSON payloads to stdout
//! 4. Reports classified errors on stderr and exits 1

mod config;
mod metrics;

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use console_auth::{CredentialStore, FileBackend, now_millis};
use console_client::{ApiClient, ApiError, UploadDescriptor, UploadFile};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "pentest-console", version, about = "Command-line client for the pentest console API")]
struct Cli {
    /// Config file (default: $CONSOLE_CONFIG, then ./pentest-console.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Print Prometheus metrics to stderr before exiting
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sign in; the password comes from CONSOLE_PASSWORD or a prompt
    Login { username: String },
    /// Forget the stored credential
    Logout,
    /// Show whether a credential is stored and when it expires
    Status,
    Get {
        path: String,
        /// Query parameter; repeat a key to send a list
        #[arg(short, long = "query", value_name = "KEY=VALUE")]
        query: Vec<String>,
    },
    Post {
        path: String,
        /// JSON body, or @file to read it from a file
        #[arg(short, long)]
        data: Option<String>,
    },
    Put {
        path: String,
        #[arg(short, long)]
        data: Option<String>,
    },
    Patch {
        path: String,
        #[arg(short, long)]
        data: Option<String>,
    },
    Delete {
        path: String,
        #[arg(short, long)]
        data: Option<String>,
    },
    /// Upload a file as multipart field `file`
    Upload {
        path: String,
        file: PathBuf,
        /// Extra form field
        #[arg(short = 'F', long = "field", value_name = "NAME=VALUE")]
        fields: Vec<String>,
        /// Report progress on stderr
        #[arg(long)]
        progress: bool,
    },
    /// Download a file into a directory
    Download {
        path: String,
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        #[arg(short, long = "query", value_name = "KEY=VALUE")]
        query: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let prometheus = if cli.print_metrics {
        match metrics::install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "failed to install metrics recorder");
                None
            }
        }
    } else {
        None
    };

    let result = run(cli).await;

    if let Some(handle) = prometheus {
        eprintln!("{}", handle.render());
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so stdout carries only payloads.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let (config_path, explicit) = Config::resolve_path(cli.config.as_deref());
    let config = if explicit || config_path.exists() {
        debug!(path = %config_path.display(), "loading configuration");
        Config::load(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        Config::from_env()?
    };

    let store = match config.credentials_path() {
        Some(path) => CredentialStore::load(FileBackend::new(path))
            .await
            .context("failed to read stored credential")?,
        None => CredentialStore::in_memory(),
    };
    let client = ApiClient::new(config.client_config(), Arc::new(store)).with_retry_hook(|event| {
        debug!(attempt = event.attempt, kind = event.error.kind().label(), "retry scheduled");
    });

    match cli.command {
        Command::Login { username } => {
            if config.credentials.path.is_none() {
                warn!("no [credentials] path configured; the login will not outlive this process");
            }
            let password = read_password()?;
            client.login(&username, &password).await?;
            info!(base_url = %config.api.base_url, "credential stored");
        }
        Command::Logout => client.logout().await,
        Command::Status => print_json(&status(&client).await)?,
        Command::Get { path, query } => {
            let params = parse_pairs(&query)?;
            print_json(&client.get(&path, Some(&params)).await?)?;
        }
        Command::Post { path, data } => {
            print_json(&client.post(&path, &read_body(data)?).await?)?;
        }
        Command::Put { path, data } => {
            print_json(&client.put(&path, &read_body(data)?).await?)?;
        }
        Command::Patch { path, data } => {
            print_json(&client.patch(&path, &read_body(data)?).await?)?;
        }
        Command::Delete { path, data } => {
            let body = data.map(|d| read_body(Some(d))).transpose()?;
            print_json(&client.delete(&path, body.as_ref()).await?)?;
        }
        Command::Upload {
            path,
            file,
            fields,
            progress,
        } => {
            let mut upload = UploadDescriptor::new(
                path,
                UploadFile::from_path_checked(&file, &client.config().upload).await?,
            );
            for field in &fields {
                let (name, value) = split_pair(field)?;
                upload = upload.field(name, value);
            }
            if progress {
                upload = upload.on_progress(|fraction| {
                    eprint!("\r{:>3.0}%", fraction * 100.0);
                    if fraction >= 1.0 {
                        eprintln!();
                    }
                });
            }
            print_json(&client.upload(upload).await?)?;
        }
        Command::Download {
            path,
            output,
            query,
        } => {
            let params = parse_pairs(&query)?;
            let download = client.download(&path, Some(&params)).await?;
            let saved = download
                .save_to(&output)
                .await
                .with_context(|| format!("failed to write into {}", output.display()))?;
            println!("{}", saved.display());
        }
    }
    Ok(())
}

/// Credential summary; token values are never printed.
async fn status(client: &ApiClient) -> Value {
    match client.store().get().await {
        Some(credential) => serde_json::json!({
            "signed_in": true,
            "expires_at": credential.expires_at,
            "near_expiry": credential.is_near_expiry_at(now_millis()),
        }),
        None => serde_json::json!({ "signed_in": false }),
    }
}

fn print_json(value: &Value) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

fn read_password() -> Result<String> {
    if let Ok(password) = std::env::var("CONSOLE_PASSWORD") {
        return Ok(password);
    }
    eprint!("Password: ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("no password given");
    }
    Ok(password)
}

/// `--data` as JSON text, or `@path` to read it from a file. Absent means `{}`.
fn read_body(data: Option<String>) -> Result<Value> {
    let Some(data) = data else {
        return Ok(Value::Object(Map::new()));
    };
    let text = match data.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read body from {path}"))?,
        None => data,
    };
    serde_json::from_str(&text).context("request body is not valid JSON")
}

fn split_pair(pair: &str) -> Result<(&str, &str)> {
    pair.split_once('=')
        .with_context(|| format!("expected KEY=VALUE, got {pair:?}"))
}

/// `KEY=VALUE` pairs into a JSON object; repeated keys become arrays.
fn parse_pairs(pairs: &[String]) -> Result<Value> {
    let mut map = Map::new();
    for pair in pairs {
        let (key, value) = split_pair(pair)?;
        let value = Value::String(value.to_string());
        match map.get_mut(key) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                map.insert(key.to_string(), value);
            }
        }
    }
    Ok(Value::Object(map))
}

/// Print an error chain; validation failures list their fields.
fn report(err: &anyhow::Error) {
    eprintln!("error: {err:#}");
    if let Some(ApiError::ValidationFailed { field_errors, .. }) = err.downcast_ref::<ApiError>() {
        for (field, messages) in field_errors {
            for message in messages {
                eprintln!("  {field}: {message}");
            }
        }
    }
}
