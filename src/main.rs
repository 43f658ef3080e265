//! apprun CLI - validate and run app manifests

use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::{Map, Value};

use apprun::config::mask_secret;
use apprun::credential::{ConfigPlatformCredentials, InMemoryVault, PlatformCredentialProvider};
use apprun::error::{FixSuggestion, ManifestError, RuntimeError};
use apprun::handler::HandlerRegistry;
use apprun::manifest::{Engine, Manifest, RawManifest};
use apprun::runtime::{Run, RunMode, RunRequest, RunStatus, Runtime, TraceStatus};
use apprun::RuntimeConfig;

/// Providers given a placeholder platform key under `--mock`
const MOCK_PROVIDERS: &[&str] = &["openai", "anthropic", "email", "image"];

#[derive(Parser)]
#[command(name = "apprun")]
#[command(about = "apprun - run declarative app manifests in try or use mode")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a manifest (no run is created)
    Validate {
        /// Path to a .json or .yaml manifest
        file: String,
    },

    /// Run a manifest once
    Run {
        /// Path to a .json or .yaml manifest
        file: String,

        /// Inputs as a JSON object, or @path to a JSON file
        #[arg(short, long)]
        inputs: Option<String>,

        /// Execution mode (try, use)
        #[arg(long, default_value = "use")]
        mode: RunMode,

        /// Caller user id (selects their own credentials)
        #[arg(short, long)]
        user: Option<String>,

        /// Allow platform credentials when the user has none
        #[arg(long)]
        fallback: bool,

        /// JSON file of user secrets: {"<user>": {"<provider>": "<key>"}}
        #[arg(long)]
        secrets: Option<String>,

        /// Use mock handlers (no network, placeholder keys)
        #[arg(long)]
        mock: bool,

        /// Print the run record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Try a manifest with its demo sample inputs
    Try {
        /// Path to a .json or .yaml manifest
        file: String,

        /// Override the demo inputs (JSON object or @path)
        #[arg(short, long)]
        inputs: Option<String>,

        /// Use mock handlers (no network, placeholder keys)
        #[arg(long)]
        mock: bool,

        /// Print the run record as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    // Load .env file (ignore if not present)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Validate { file } => validate_manifest(&file),
        Commands::Run {
            file,
            inputs,
            mode,
            user,
            fallback,
            secrets,
            mock,
            json,
        } => {
            let options = RunOptions {
                inputs,
                mode,
                user,
                fallback,
                secrets,
                mock,
                json,
            };
            run_manifest(&file, options).await
        }
        Commands::Try {
            file,
            inputs,
            mock,
            json,
        } => {
            let options = RunOptions {
                inputs,
                mode: RunMode::Try,
                user: None,
                fallback: false,
                secrets: None,
                mock,
                json,
            };
            run_manifest(&file, options).await
        }
    };

    match result {
        Ok(RunStatus::Failed) => std::process::exit(1),
        Ok(_) => {}
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            if let Some(suggestion) = e.fix_suggestion() {
                eprintln!("  {} {}", "Fix:".yellow(), suggestion);
            }
            std::process::exit(1);
        }
    }
}

struct RunOptions {
    inputs: Option<String>,
    mode: RunMode,
    user: Option<String>,
    fallback: bool,
    secrets: Option<String>,
    mock: bool,
    json: bool,
}

fn load_manifest(file: &str) -> Result<RawManifest, RuntimeError> {
    let content = std::fs::read_to_string(file)?;
    let is_yaml = Path::new(file)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| matches!(e, "yaml" | "yml"));

    let raw = if is_yaml {
        RawManifest::from_yaml(&content)?
    } else {
        RawManifest::from_json(&content)?
    };
    Ok(raw)
}

/// `{"k": v}` inline, or `@path` to a JSON file
fn parse_inputs(arg: Option<&str>) -> Result<Map<String, Value>, RuntimeError> {
    let Some(arg) = arg else {
        return Ok(Map::new());
    };

    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)?,
        None => arg.to_string(),
    };

    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(invalid_inputs("must be a JSON object")),
        Err(e) => Err(invalid_inputs(&e.to_string())),
    }
}

fn invalid_inputs(reason: &str) -> RuntimeError {
    ManifestError::Invalid {
        field: "--inputs".to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn load_config() -> Result<RuntimeConfig, RuntimeError> {
    let config = RuntimeConfig::load()?.with_env();
    config.validate()?;
    Ok(config)
}

fn build_runtime(config: &RuntimeConfig, options: &RunOptions) -> Result<Runtime, RuntimeError> {
    let vault = match &options.secrets {
        Some(path) => {
            let content = std::fs::read_to_string(path)?;
            InMemoryVault::from_json(&content).map_err(|e| RuntimeError::Config {
                reason: e.to_string(),
            })?
        }
        None => InMemoryVault::new(),
    };

    let (registry, platform): (HandlerRegistry, Arc<dyn PlatformCredentialProvider>) =
        if options.mock {
            (
                HandlerRegistry::mock(),
                Arc::new(ConfigPlatformCredentials::uniform(MOCK_PROVIDERS, "mock-key")),
            )
        } else {
            for (provider, key) in &config.platform {
                tracing::debug!(%provider, key = %mask_secret(key, 4), "platform key configured");
            }
            (
                HandlerRegistry::standard(config)?,
                Arc::new(ConfigPlatformCredentials::from_config(config)),
            )
        };

    Ok(Runtime::new(
        registry,
        Arc::new(vault),
        platform,
        config.limits.clone(),
    ))
}

fn validate_manifest(file: &str) -> Result<RunStatus, RuntimeError> {
    let raw = load_manifest(file)?;
    let config = load_config()?;
    let registry = HandlerRegistry::standard(&config)?;
    let manifest = apprun::manifest::Validator::new(&registry).validate(&raw)?;

    println!("{} Manifest '{}' is valid", "✓".green(), file);
    print_summary(&manifest);
    Ok(RunStatus::Completed)
}

fn print_summary(manifest: &Manifest) {
    println!("  App: {} ({}) v{}", manifest.name, manifest.id, manifest.version);
    match &manifest.engine {
        Engine::Steps => println!("  Engine: steps ({} steps)", manifest.steps.len()),
        Engine::Remote(target) => println!("  Engine: remote ({} {})", target.method, target.url),
    }
    let permissions: Vec<&str> = manifest.permissions.iter().map(String::as_str).collect();
    println!("  Permissions: {}", permissions.join(", "));
    let inputs: Vec<&str> = manifest.inputs_schema.keys().map(String::as_str).collect();
    println!("  Inputs: {}", if inputs.is_empty() { "(none)".to_string() } else { inputs.join(", ") });
}

async fn run_manifest(file: &str, options: RunOptions) -> Result<RunStatus, RuntimeError> {
    let raw = load_manifest(file)?;
    let inputs = parse_inputs(options.inputs.as_deref())?;
    let config = load_config()?;
    let runtime = build_runtime(&config, &options)?;

    let mut request = RunRequest::new(raw, options.mode)
        .with_inputs(inputs)
        .with_fallback(options.fallback);
    if let Some(user) = &options.user {
        request = request.with_user(user.clone());
    }

    let run = runtime.run_app(request).await?;

    if options.json {
        let record = run.to_record();
        println!("{}", serde_json::to_string_pretty(&record).unwrap_or_default());
    } else {
        print_run(&run);
    }
    Ok(run.status())
}

fn print_run(run: &Run) {
    let status = match run.status() {
        RunStatus::Completed => run.status().as_str().green().bold(),
        RunStatus::Partial => run.status().as_str().yellow().bold(),
        _ => run.status().as_str().red().bold(),
    };
    println!(
        "{} Run {} [{}] {} in {}ms",
        "→".cyan(),
        run.id(),
        run.mode(),
        status,
        run.duration_ms()
    );

    if !run.outputs().is_empty() {
        println!("{}", "Outputs:".cyan().bold());
        for (key, value) in run.outputs() {
            match value {
                Value::String(s) => println!("  {}: {}", key, s),
                other => println!("  {}: {}", key, other),
            }
        }
    }

    println!("{}", "Trace:".cyan().bold());
    for entry in run.trace() {
        let mark = match entry.status {
            TraceStatus::Ok => "✓".green(),
            TraceStatus::Error => "✗".red(),
            TraceStatus::Skipped => "-".dimmed(),
        };
        let mut line = format!("  {} {} {}ms", mark, entry.tool, entry.duration_ms);
        if let Some(tokens) = entry.tokens_used {
            line.push_str(&format!(" {} tokens", tokens));
        }
        if let Some(kind) = entry.error_kind {
            line.push_str(&format!(" ({})", kind));
        }
        println!("{}", line);
    }
}
