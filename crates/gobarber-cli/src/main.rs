//! GoBarber CLI - sign in to GoBarber from the terminal.
//!
//! Builds one `SessionStore` at startup, restores the persisted session and
//! runs the requested command inside a `SessionProvider` scope.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use gobarber_core::{
    use_session, ApiClient, Config, FileStore, SessionProvider, SessionStore, SignInCredentials,
    StorageKeys,
};
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "Usage: gobarber <command>

Commands:
  login [email]   Sign in and remember the session (defaults to the last email)
  logout          Forget the stored session
  whoami          Show the signed-in user";

enum Command {
    Login(Option<String>),
    Logout,
    WhoAmI,
}

impl Command {
    fn parse(args: &[String]) -> Option<Self> {
        match args.first().map(String::as_str) {
            Some("login") => Some(Command::Login(args.get(1).cloned())),
            Some("logout") => Some(Command::Logout),
            Some("whoami") => Some(Command::WhoAmI),
            _ => None,
        }
    }
}

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = Command::parse(&args) else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let config = Config::load()?;
    let data_dir = config.data_dir()?;
    debug!(api = %config.api_base_url, data_dir = %data_dir.display(), "Configuration loaded");

    let api = ApiClient::from_config(&config).context("Failed to create API client")?;
    let store = SessionStore::start(
        Arc::new(api),
        Arc::new(FileStore::new(&data_dir)),
        StorageKeys::new(&config.storage_prefix),
    );

    SessionProvider::scope(store, run(command, config)).await
}

async fn run(command: Command, config: Config) -> Result<()> {
    let session = use_session();
    let state = session.wait_until_loaded().await;

    match command {
        Command::Login(email) => {
            let email = match email.or_else(|| config.last_email.clone()) {
                Some(email) => email,
                None => prompt("Email: ")?,
            };
            let password =
                rpassword::prompt_password("Password: ").context("Failed to read password")?;

            let user = session
                .sign_in(&SignInCredentials::new(email, password))
                .await
                .context("Sign in failed")?;
            info!(user_id = %user.id, "Login complete");
            println!("Signed in as {} <{}>", user.name, user.email);

            Config::remember_email(&user.email).context("Failed to save config")?;
        }
        Command::Logout => {
            let was_signed_in = session.is_signed_in();
            session.sign_out().await.context("Sign out failed")?;
            println!("{}", logout_message(was_signed_in));
        }
        Command::WhoAmI => match state.user() {
            Some(user) => println!("{} <{}>", user.name, user.email),
            None => println!("Not signed in"),
        },
    }
    Ok(())
}

fn logout_message(was_signed_in: bool) -> &'static str {
    if was_signed_in {
        "Signed out"
    } else {
        "Not signed in"
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin()
        .read_line(&mut line)
        .context("Failed to read input")?;
    Ok(line.trim().to_string())
}
