use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use edit_bridge::bridge::{transport, CapabilitySet};
use edit_bridge::dispatcher::Caller;
use edit_bridge::error::AppError;
use edit_bridge::interactive::{execute_text, format_invocation, Interactive};
use edit_bridge::paths;
use edit_bridge::registry::catalog::{help_text, tools_json};
use edit_bridge::settings::{self, Settings};
use edit_bridge::state::AppState;

// ── CLI argument parsing ─────────────────────────────────────────

#[derive(Parser)]
#[command(name = "edit-bridge", about = "Natural-language and agent command pipeline for video editing", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Project file to edit (created on first save). Defaults to an in-memory sample project.
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    /// Config directory override
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Suppress feedback text after each command
    #[arg(long, global = true)]
    no_feedback: bool,

    /// Log filter, e.g. `debug` or `edit_bridge=trace` (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output raw JSON instead of formatted text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Read edits from stdin line by line (default)
    Interactive {
        /// Agent program to serve a protocol session to while the loop runs
        #[arg(long)]
        agent: Option<String>,
        /// Argument for the agent program (repeatable)
        #[arg(long = "agent-arg", allow_hyphen_values = true)]
        agent_args: Vec<String>,
    },
    /// Resolve one sentence and execute it
    Cmd {
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Execute a command by name with key=value parameters
    Run {
        command: String,
        /// Parameters as key=value; values are parsed as JSON when possible
        params: Vec<String>,
    },
    /// Print the tool catalog, or help for one command
    Tools { name: Option<String> },
    /// Serve one protocol session on stdin/stdout
    Serve,
    /// Spawn an agent process and serve a protocol session over its stdio
    Connect {
        program: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Settings management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective settings
    Show,
    /// Write the default settings file
    Init,
    /// Store the LLM API key in the credentials file
    SetKey { key: String },
}

// ── Helpers ──────────────────────────────────────────────────────

fn init_tracing(cli_level: Option<&str>, default_level: &str) {
    let filter = match cli_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// `key=value` pairs into a parameter map. Values that parse as JSON keep
/// their type, anything else is a string.
fn parse_assignments(pairs: &[String]) -> Result<Map<String, Value>, AppError> {
    let mut map = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| AppError::invalid(pair, "expected key=value"))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(key.trim().to_string(), value);
    }
    Ok(map)
}

fn print_json(value: &impl serde::Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("Error: {e}"),
    }
}

async fn run_command(cli: Cli, settings: Settings, config_dir: PathBuf) -> Result<(), AppError> {
    let command = cli.command.unwrap_or(Commands::Interactive {
        agent: None,
        agent_args: Vec::new(),
    });
    if let Commands::Config { action } = &command {
        return run_config(action, &settings, &config_dir);
    }

    let state = AppState::new(settings, config_dir, cli.project.as_deref())?;
    match command {
        Commands::Interactive { agent, agent_args } => {
            let agent = match agent {
                Some(program) => Some(transport::spawn_connect(state.bridge()?, program, agent_args)),
                None => None,
            };
            Interactive::new(&state, tokio::io::stdout(), cli.json)
                .run(BufReader::new(tokio::io::stdin()))
                .await?;
            if let Some(agent) = agent {
                match agent.finish(transport::AGENT_EXIT_GRACE).await {
                    Ok(Some(info)) => {
                        tracing::info!(session = %info.id, negotiated = %info.negotiated.label(), "agent session finished");
                    }
                    Ok(None) => tracing::warn!("agent session stopped with the interactive loop"),
                    Err(e) => tracing::error!(error = %e, "agent session failed"),
                }
            }
            state.save()?;
        }
        Commands::Cmd { text } => {
            let invocation = execute_text(&state, &text.join(" ")).await?;
            println!("{}", format_invocation(&invocation, cli.json));
        }
        Commands::Run { command, params } => {
            let params = parse_assignments(&params)?;
            let invocation = state
                .dispatcher
                .execute(&command, &params, Caller::Human, None)
                .await?;
            state.save()?;
            println!("{}", format_invocation(&invocation, cli.json));
        }
        Commands::Tools { name } => {
            if cli.json {
                print_json(&tools_json(&state.registry, CapabilitySet::all()));
            } else {
                println!("{}", help_text(&state.registry, name.as_deref()));
            }
        }
        Commands::Serve => {
            let bridge = state.bridge()?;
            let info = transport::serve_stdio(&bridge).await?;
            tracing::info!(session = %info.id, negotiated = %info.negotiated.label(), "stdio session finished");
            state.save()?;
        }
        Commands::Connect { program, args } => {
            let bridge = state.bridge()?;
            let info = transport::connect(&bridge, &program, &args).await?;
            tracing::info!(session = %info.id, negotiated = %info.negotiated.label(), "agent session finished");
            state.save()?;
        }
        Commands::Config { .. } => {}
    }
    Ok(())
}

fn run_config(action: &ConfigAction, settings: &Settings, config_dir: &std::path::Path) -> Result<(), AppError> {
    match action {
        ConfigAction::Show => {
            print_json(settings);
            println!("config dir: {}", config_dir.display());
        }
        ConfigAction::Init => {
            settings::save_settings(config_dir, &Settings::default())?;
            println!("Wrote {}", paths::settings_path(config_dir).display());
        }
        ConfigAction::SetKey { key } => {
            settings::save_api_key(config_dir, key.trim())?;
            println!("Saved API key to {}", paths::credentials_path(config_dir).display());
        }
    }
    Ok(())
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_dir = cli.config.clone().unwrap_or_else(paths::default_config_dir);
    let mut settings = match Settings::load(&config_dir) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(e.exit_code());
        }
    };
    if cli.no_feedback {
        settings.feedback_enabled = false;
    }
    init_tracing(cli.log_level.as_deref(), &settings.log_level);

    if let Err(e) = run_command(cli, settings, config_dir).await {
        eprintln!("Error: {e}");
        process::exit(e.exit_code());
    }
}
