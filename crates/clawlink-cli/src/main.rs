use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use clawlink_core::config::validation::validate_config_value;
use clawlink_core::config::{self, ConfigLoader, write_config_file};
use clawlink_core::device_auth::DeviceAuthStore;
use clawlink_core::device_identity::{load_or_create_device_identity, public_key_raw_base64url};
use clawlink_core::paths;
use clawlink_gateway::{CallGatewayOptions, call_gateway};
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "clawlink",
    about = "Command-line client for OpenClaw gateways",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args, Clone)]
struct GatewayArgs {
    /// Gateway WebSocket URL (overrides config)
    #[arg(long)]
    url: Option<String>,

    /// Gateway token
    #[arg(long)]
    token: Option<String>,

    /// Gateway password
    #[arg(long)]
    password: Option<String>,

    /// Expected SHA-256 fingerprint of the gateway TLS certificate
    #[arg(long)]
    tls_fingerprint: Option<String>,

    /// Timeout in milliseconds
    #[arg(long, default_value_t = 10_000)]
    timeout: u64,

    /// Print the raw JSON response
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a gateway method
    Call {
        method: String,

        /// Request params as JSON
        #[arg(long)]
        params: Option<String>,

        /// Wait past interim "accepted" responses
        #[arg(long)]
        expect_final: bool,

        #[command(flatten)]
        gateway: GatewayArgs,
    },

    /// Check gateway health
    Health {
        #[command(flatten)]
        gateway: GatewayArgs,
    },

    /// Show gateway status
    Status {
        #[command(flatten)]
        gateway: GatewayArgs,
    },

    /// Show this device's identity
    Identity {
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the resolved configuration
    Show,
    /// Get a config value by dotted path
    Get { key: String },
    /// Set a config value (JSON5 literal or plain string)
    Set { key: String, value: String },
    /// Remove a config value
    Unset { key: String },
    /// Validate the config file
    Validate {
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(verbose: bool, loader: &ConfigLoader) {
    // Read the config silently: no subscriber is installed yet.
    let logging = loader.try_load().ok().and_then(|c| c.logging);
    let default_level = if verbose {
        "debug".to_string()
    } else {
        logging
            .as_ref()
            .and_then(|l| l.level.clone())
            .unwrap_or_else(|| "info".to_string())
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_level));
    let json = logging.and_then(|l| l.format).as_deref() == Some("json");

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(paths::resolve_config_path);
    let loader = ConfigLoader::new(config_path);
    init_logging(cli.verbose, &loader);

    match cli.command {
        Commands::Call {
            method,
            params,
            expect_final,
            gateway,
        } => {
            let params = params
                .map(|p| json5::from_str::<Value>(&p))
                .transpose()
                .context("--params must be valid JSON")?;
            let payload = run_call(&loader, &method, params, expect_final, &gateway).await?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Commands::Health { gateway } => {
            let payload = run_call(&loader, "health", None, false, &gateway).await?;
            print_payload("Gateway health", &payload, gateway.json)?;
        }
        Commands::Status { gateway } => {
            let payload = run_call(&loader, "status", None, false, &gateway).await?;
            print_payload("Gateway status", &payload, gateway.json)?;
        }
        Commands::Identity { json } => {
            let path = paths::resolve_identity_path();
            let identity = load_or_create_device_identity(&path)?;
            let public_key = public_key_raw_base64url(&identity.public_key_pem)?;
            if json {
                let out = json!({
                    "deviceId": identity.device_id,
                    "publicKey": public_key,
                    "path": path,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("Device ID: {}", identity.device_id);
                println!("Public key: {public_key}");
                println!("Identity file: {}", path.display());
            }
        }
        Commands::Config { action } => run_config(&loader, action)?,
    }

    Ok(())
}

async fn run_call(
    loader: &ConfigLoader,
    method: &str,
    params: Option<Value>,
    expect_final: bool,
    args: &GatewayArgs,
) -> anyhow::Result<Value> {
    let mut options = CallGatewayOptions::new(method);
    options.params = params;
    options.expect_final = expect_final;
    options.timeout = Duration::from_millis(args.timeout);
    options.url = args.url.clone();
    options.token = args.token.clone();
    options.password = args.password.clone();
    options.tls_fingerprint = args.tls_fingerprint.clone();
    options.config = Some(loader.load_config());
    options.config_path = Some(loader.config_path().to_path_buf());

    match load_or_create_device_identity(&paths::resolve_identity_path()) {
        Ok(identity) => {
            options.device_identity = Some(identity);
            options.token_store = Some(DeviceAuthStore::new(DeviceAuthStore::default_path()));
        }
        Err(e) => tracing::warn!("Device identity unavailable, connecting without it: {e}"),
    }

    Ok(call_gateway(options).await?)
}

fn print_payload(title: &str, payload: &Value, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(payload)?);
        return Ok(());
    }
    println!("{title}");
    match payload {
        Value::Object(map) => {
            for (key, value) in map {
                let rendered = match value {
                    Value::Object(inner) => format!("{{{} keys}}", inner.len()),
                    Value::Array(items) => format!("[{} items]", items.len()),
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                println!("  {key}: {rendered}");
            }
        }
        other => println!("  {other}"),
    }
    Ok(())
}

/// The file's own tree: parsed JSON5 with `$include` and `${VAR}` left intact.
fn read_source_value(loader: &ConfigLoader) -> anyhow::Result<Value> {
    let snapshot = loader.read_snapshot();
    match snapshot.raw {
        Some(raw) => json5::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", loader.config_path().display())),
        None => Ok(Value::Object(Map::new())),
    }
}

/// Apply `edit` to both the file tree and the resolved tree, validate the
/// resolved result, then write the file tree.
fn edit_config(
    loader: &ConfigLoader,
    mut edit: impl FnMut(&mut Value) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let mut source = read_source_value(loader)?;
    let mut resolved = loader.resolve_value()?;
    edit(&mut source)?;
    edit(&mut resolved)?;

    if let Err(issues) = validate_config_value(&resolved) {
        for issue in &issues {
            eprintln!("  {issue}");
        }
        bail!("Config would be invalid; nothing written");
    }
    write_config_file(loader.config_path(), &source)?;
    loader.invalidate();
    Ok(())
}

fn parse_cli_value(raw: &str) -> Value {
    json5::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn run_config(loader: &ConfigLoader, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = loader.try_load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigAction::Get { key } => {
            let resolved = loader.resolve_value()?;
            match config::get_path(&resolved, &key) {
                Some(Value::String(s)) => println!("{s}"),
                Some(value) => println!("{}", serde_json::to_string_pretty(value)?),
                None => bail!("Config path not found: {key}"),
            }
        }
        ConfigAction::Set { key, value } => {
            let value = parse_cli_value(&value);
            edit_config(loader, |tree| {
                config::set_path(tree, &key, value.clone())?;
                Ok(())
            })?;
            println!("Updated {key}. Restart the gateway to apply.");
        }
        ConfigAction::Unset { key } => {
            let mut found = false;
            edit_config(loader, |tree| {
                found |= config::unset_path(tree, &key).is_some();
                Ok(())
            })?;
            if !found {
                bail!("Config path not found: {key}");
            }
            println!("Removed {key}. Restart the gateway to apply.");
        }
        ConfigAction::Validate { json } => {
            let snapshot = loader.read_snapshot();
            if json {
                let out = json!({
                    "path": snapshot.path,
                    "exists": snapshot.exists,
                    "valid": snapshot.valid,
                    "issues": snapshot.issues,
                    "legacyIssues": snapshot.legacy_issues,
                    "error": snapshot.error,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else if snapshot.valid {
                println!("Config valid: {}", snapshot.path.display());
                for issue in &snapshot.legacy_issues {
                    println!("  warning: {}: {}", issue.path, issue.message);
                }
            } else {
                println!("Config invalid: {}", snapshot.path.display());
                if let Some(error) = &snapshot.error {
                    println!("  {error}");
                }
                for issue in &snapshot.issues {
                    println!("  {issue}");
                }
            }
            if !snapshot.valid {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
