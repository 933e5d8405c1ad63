use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use gcredstash::api::http_client;
use gcredstash::auth;
use gcredstash::config::{default_config_path, Config, ConfigOverrides, ResolvedConfig};
use gcredstash::credstash::Credstash;
use gcredstash::keystore::DatastoreKeyStore;
use gcredstash::kms::CloudKms;
use gcredstash::resource::KeyRingRef;
use secrecy::{ExposeSecret, SecretString};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_ENV_VAR: &str = "GCREDSTASH_LOG";

#[derive(Parser, Debug)]
#[command(name = "gcredstash")]
#[command(version, about = "Manage credentials using Google Cloud KMS and Datastore")]
struct Cli {
    /// Google Cloud project id
    #[arg(long, global = true)]
    project_id: Option<String>,

    /// KMS location id [default: global]
    #[arg(long, global = true)]
    location_id: Option<String>,

    /// KMS key ring id [default: gcredstash]
    #[arg(long, global = true)]
    keyring_id: Option<String>,

    /// KMS crypto key id [default: gcredstash]
    #[arg(long, global = true)]
    key_id: Option<String>,

    /// Datastore kind holding the credentials [default: Credential]
    #[arg(long, global = true)]
    kind: Option<String>,

    /// Path to config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Encrypt a credential and store it
    Put {
        /// Credential name
        name: String,
        /// Credential value
        plaintext: String,
    },
    /// Fetch and decrypt a credential
    Get {
        /// Credential name
        name: String,
        /// Do not print a trailing newline
        #[arg(short = 'n', long)]
        no_newline: bool,
    },
    /// Fetch and decrypt every credential
    GetAll {
        /// Print a JSON object instead of `name: value` lines
        #[arg(long)]
        json: bool,
    },
    /// List credential names without decrypting
    List,
    /// Create a KMS key ring
    CreateKeyring {
        /// Id of the new key ring
        new_keyring_id: String,
    },
    /// Create a KMS crypto key in the configured key ring
    CreateKey {
        /// Id of the new crypto key
        new_key_id: String,
    },
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            project_id: self.project_id.clone(),
            location_id: self.location_id.clone(),
            keyring_id: self.keyring_id.clone(),
            key_id: self.key_id.clone(),
            kind: self.kind.clone(),
        }
    }
}

fn print_help() -> ExitCode {
    let mut command = Cli::command();
    match command.print_help() {
        Ok(()) => {
            println!();
            ExitCode::SUCCESS
        }
        Err(_) => ExitCode::FAILURE,
    }
}

fn log_filter(verbose: u8) -> EnvFilter {
    let level = match verbose {
        0 => None,
        1 => Some("info"),
        _ => Some("debug"),
    };
    match level {
        Some(level) => EnvFilter::new(format!("warn,gcredstash={level}")),
        None => EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("warn")),
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if err.kind() == ErrorKind::InvalidSubcommand => return print_help(),
        Err(err) => err.exit(),
    };
    let Some(command) = cli.command.clone() else {
        return print_help();
    };

    let subscriber = tracing_subscriber::registry().with(log_filter(cli.verbose)).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_level(true),
    );
    let dispatch = tracing::Dispatch::new(subscriber);

    let result = tracing::dispatcher::with_default(&dispatch, || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to start async runtime")
            .and_then(|runtime| runtime.block_on(run(&cli, command)))
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli, command: Command) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(&default_config_path())?,
    };

    let client = http_client(config.request_timeout())?;
    let tokens = auth::discover(&client, |name| std::env::var(name).ok()).await?;
    tracing::debug!(provider = tokens.name(), "Resolved credentials");

    let resolved = ResolvedConfig::resolve(
        config,
        cli.overrides(),
        |name| std::env::var(name).ok(),
        tokens.project_id(),
    )?;

    let kms = CloudKms::new(client.clone(), tokens.clone()).with_base_url(&resolved.kms_endpoint);
    let store = DatastoreKeyStore::new(&resolved.project_id, client, tokens)
        .with_base_url(&resolved.datastore_endpoint);
    let credstash = Credstash::new(Arc::new(kms), Arc::new(store));

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match command {
        Command::Put { name, plaintext } => {
            let plaintext = SecretString::new(plaintext.into());
            credstash
                .put(&resolved.crypto_key(), &resolved.kind, &name, &plaintext)
                .await
                .with_context(|| format!("Failed to store {name:?}"))?;
        }
        Command::Get { name, no_newline } => {
            let plaintext = credstash
                .get(&resolved.crypto_key(), &resolved.kind, &name)
                .await
                .with_context(|| format!("Failed to get {name:?}"))?;
            if no_newline {
                write!(out, "{}", plaintext.expose_secret())?;
            } else {
                writeln!(out, "{}", plaintext.expose_secret())?;
            }
        }
        Command::GetAll { json } => {
            let report = credstash
                .get_all(&resolved.crypto_key(), &resolved.kind)
                .await
                .context("Failed to fetch credentials")?;

            if json {
                let values: std::collections::BTreeMap<&str, &str> = report
                    .secrets
                    .iter()
                    .map(|(name, value)| (name.as_str(), value.expose_secret()))
                    .collect();
                writeln!(out, "{}", serde_json::to_string_pretty(&values)?)?;
            } else {
                for (name, value) in &report.secrets {
                    writeln!(out, "{name}: {}", value.expose_secret())?;
                }
            }
            out.flush()?;

            for (name, err) in &report.failures {
                eprintln!("warning: skipped {name:?}: {err}");
            }
            if !report.is_complete() {
                anyhow::bail!(
                    "{} of {} credentials could not be read",
                    report.failures.len(),
                    report.failures.len() + report.secrets.len()
                );
            }
        }
        Command::List => {
            for name in credstash.list(&resolved.kind).await? {
                writeln!(out, "{name}")?;
            }
        }
        Command::CreateKeyring { new_keyring_id } => {
            let ring = KeyRingRef::new(
                &resolved.project_id,
                &resolved.location_id,
                new_keyring_id,
            );
            let created = credstash
                .create_key_ring(&ring)
                .await
                .with_context(|| format!("Failed to create key ring {ring}"))?;
            writeln!(out, "{}", created.name)?;
        }
        Command::CreateKey { new_key_id } => {
            let ring = resolved.key_ring();
            let created = credstash
                .create_key(&ring, &new_key_id)
                .await
                .with_context(|| format!("Failed to create key {new_key_id:?} in {ring}"))?;
            writeln!(out, "{}", created.name)?;
        }
    }

    out.flush()?;
    Ok(())
}
