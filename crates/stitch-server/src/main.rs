//! stitch - streams LLM answers that outgrow a single reply

mod config;
mod prompts;
mod routes;

use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use stitch_ai::{CredentialResolver, ProviderRegistry};
use stitch_stream::ContinuationController;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::routes::AppState;

/// stitch - segmented LLM response server
#[derive(Parser, Debug)]
#[command(name = "stitch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on (default: 127.0.0.1:8080)
    #[arg(short, long)]
    bind: Option<String>,

    /// Config file (default: <config dir>/stitch/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("stitch=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_state(cfg: &Config) -> anyhow::Result<AppState> {
    let limits = cfg.limits()?;
    let default_provider = cfg.default_provider()?;
    let system_prompt = prompts::load_system_prompt(cfg.system_prompt_file.as_deref());

    let controller = ContinuationController::new(
        ProviderRegistry::with_defaults(),
        CredentialResolver::new(cfg.api_keys.configured()),
        limits,
    )
    .with_system_prompt(system_prompt);

    Ok(AppState {
        controller,
        default_provider,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config_path = args.config.clone().unwrap_or_else(Config::config_path);

    // Initialize config and exit
    if args.init_config {
        Config::init(&config_path)
            .with_context(|| format!("creating config at {}", config_path.display()))?;
        println!("Config file at: {}", config_path.display());
        println!("\nExample config:\n{}", config::example_config());
        return Ok(());
    }

    let cfg = Config::load_from(&config_path);

    // CLI takes precedence over the config file
    let bind = args
        .bind
        .or_else(|| cfg.bind.clone())
        .unwrap_or_else(|| config::DEFAULT_BIND.to_string());

    if args.print_config {
        let limits = cfg.limits()?;
        let credentials = CredentialResolver::new(cfg.api_keys.configured());
        println!("config file:    {}", config_path.display());
        println!("bind:           {}", bind);
        println!("provider:       {}", cfg.default_provider()?);
        println!("max_tokens:     {}", limits.max_tokens);
        println!("max_segments:   {}", limits.max_segments);
        println!(
            "system prompt:  {}",
            cfg.system_prompt_file.as_deref().unwrap_or("(built-in)")
        );
        for provider in stitch_ai::Provider::ALL {
            let status = if credentials.has_server_key(provider) {
                "configured"
            } else {
                "missing"
            };
            println!("{:<15} {}", format!("{} key:", provider), status);
        }
        return Ok(());
    }

    let state = build_state(&cfg)?;
    routes::run_http(state, &bind).await
}
