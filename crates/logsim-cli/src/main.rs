//! logsim - command-line client for the Log Simulator backend.
//!
//! Every backend call goes through the shared authenticated pipeline, so an
//! expired access token is refreshed transparently and the saved session is
//! updated on disk.

use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use logsim_core::api::{Method, RequestDescriptor};
use logsim_core::auth::{AuthState, CredentialStore};
use logsim_core::config::API_URL_ENV;
use logsim_core::{ApiClient, ApiError, Config, SessionStore};

#[derive(Parser, Debug)]
#[command(name = "logsim", version, about = "Log Simulator console client")]
struct Cli {
    /// Backend base URL, overriding the config file
    #[arg(long, global = true, env = API_URL_ENV)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and save the session
    Login {
        /// Account name; defaults to the last one used
        #[arg(short, long)]
        username: Option<String>,

        /// Remember the password in the OS keychain
        #[arg(long)]
        remember: bool,
    },
    /// End the session locally and on the backend
    Logout,
    /// Show the logged-in account
    Whoami,
    /// Show session state and cached responses
    Status,
    /// GET a backend path
    Get(ReadArgs),
    /// POST a JSON body to a backend path
    Post(WriteArgs),
    /// PUT a JSON body to a backend path
    Put(WriteArgs),
    /// DELETE a backend path
    Delete {
        path: String,
    },
}

#[derive(Args, Debug)]
struct ReadArgs {
    path: String,

    /// Query parameter as key=value; repeatable
    #[arg(short, long = "query", value_parser = parse_pair)]
    query: Vec<(String, String)>,
}

#[derive(Args, Debug)]
struct WriteArgs {
    path: String,

    /// JSON request body
    #[arg(short, long, default_value = "{}")]
    data: String,
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing();

    let mut config = Config::load()?;
    if let Some(url) = cli.api_url.clone() {
        config.api_url = Some(url);
    }

    let session = SessionStore::persistent(config.session_path()?)?;
    let client = ApiClient::new(&config, session).context("Failed to create HTTP client")?;
    info!(api = client.base_url(), "logsim starting");

    let mut changes = client.session().subscribe();
    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            if changes.borrow_and_update().is_expired() {
                warn!("Session expired");
            }
        }
    });

    match cli.command {
        Command::Login { username, remember } => login(&client, &mut config, username, remember).await,
        Command::Logout => {
            client.logout().await;
            println!("Logged out.");
            Ok(())
        }
        Command::Whoami => whoami(&client).await,
        Command::Status => {
            status(&client);
            Ok(())
        }
        Command::Get(args) => {
            let mut descriptor = RequestDescriptor::get(args.path);
            for (key, value) in args.query {
                descriptor = descriptor.query(key, value);
            }
            run(&client, descriptor).await
        }
        Command::Post(args) => {
            let body = parse_body(&args.data)?;
            run(&client, RequestDescriptor::post(args.path, body)).await
        }
        Command::Put(args) => {
            let body = parse_body(&args.data)?;
            run(&client, RequestDescriptor::put(args.path, body)).await
        }
        Command::Delete { path } => run(&client, RequestDescriptor::delete(path)).await,
    }
}

fn parse_body(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).context("--data is not valid JSON")
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

async fn login(
    client: &ApiClient,
    config: &mut Config,
    username: Option<String>,
    remember: bool,
) -> Result<()> {
    let username = match username.or_else(|| config.last_username.clone()) {
        Some(name) => name,
        None => prompt("Username: ")?,
    };
    if username.is_empty() {
        bail!("A username is required");
    }

    let stored = if config.remember {
        CredentialStore::get_password(&username).unwrap_or_else(|e| {
            warn!(error = %e, "Could not read keychain");
            None
        })
    } else {
        None
    };
    let from_keychain = stored.is_some();
    let password = match stored {
        Some(password) => password,
        None => rpassword::prompt_password("Password: ")?,
    };

    match client.login(&username, &password).await {
        Ok(profile) => {
            println!("Logged in as {}.", profile.display());
        }
        Err(ApiError::Unauthorized) => {
            if from_keychain {
                // The remembered password is stale
                if let Err(e) = CredentialStore::delete(&username) {
                    warn!(error = %e, "Could not remove stale password from keychain");
                }
            }
            bail!("Incorrect username or password");
        }
        Err(e) => return Err(report(&e)),
    }

    let remember = remember || config.remember;
    if remember && !from_keychain {
        if let Err(e) = CredentialStore::store(&username, &password) {
            warn!(error = %e, "Could not save password to keychain");
        }
    }
    config.last_username = Some(username);
    config.remember = remember;
    config.save()?;
    Ok(())
}

async fn whoami(client: &ApiClient) -> Result<()> {
    match client.load_profile().await {
        Ok(profile) => {
            println!("{} ({})", profile.display(), profile.username);
            if let Some(ref email) = profile.email {
                println!("  email: {}", email);
            }
            if let Some(ref role) = profile.role {
                println!("  role:  {}", role.name);
            }
            Ok(())
        }
        Err(e) => Err(failure(client, &e)),
    }
}

fn status(client: &ApiClient) {
    let session = client.session().get();
    println!("Backend: {}", client.base_url());
    let state = match session.auth_state {
        AuthState::Unauthenticated => "not logged in",
        AuthState::Authenticating => "logged in, profile not loaded",
        AuthState::Authenticated => "logged in",
        AuthState::RefreshInFlight => "refreshing",
        AuthState::Expired => "expired",
    };
    println!("Session: {}", state);
    if let Some(ref profile) = session.profile {
        println!("Account: {} ({})", profile.display(), profile.username);
    }

    let ages = client.cache().ages();
    if ages.is_empty() {
        println!("Cache:   empty");
    } else {
        println!("Cache:");
        for (key, age) in ages {
            println!("  {:<40} {}", key, age);
        }
    }
}

async fn run(client: &ApiClient, descriptor: RequestDescriptor) -> Result<()> {
    debug!(method = %descriptor.method(), path = descriptor.path(), "Calling backend");
    let deleting = descriptor.method() == Method::Delete;
    match client.call(&descriptor).await {
        Ok(Value::Null) if deleting => {
            println!("Deleted.");
            Ok(())
        }
        Ok(payload) => {
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        Err(e) => Err(failure(client, &e)),
    }
}

/// Turn a failed call into an error for the user, pointing at `login` when
/// the session is gone.
fn failure(client: &ApiClient, error: &ApiError) -> anyhow::Error {
    if matches!(error, ApiError::Unauthorized) && client.session().get().is_expired() {
        return anyhow::anyhow!("Session expired. Run `logsim login`.");
    }
    report(error)
}

fn report(error: &ApiError) -> anyhow::Error {
    debug!(error = %error, "Call failed");
    let mut message = error.user_message();
    for field in error.field_errors() {
        message.push_str(&format!("\n  {}: {}", field.field().unwrap_or("-"), field.msg));
    }
    anyhow::anyhow!(message)
}
