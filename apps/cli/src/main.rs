use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use tutorgate_core_sdk::models::{ChatRequest, Message, ProviderInput};
use tutorgate_core_sdk::{server, telemetry, Gateway, GatewayConfig, Registry};

/**
 * \brief CLI entry for the completion gateway: admin server, registry maintenance and one-shot chat.
 */
#[derive(Parser, Debug)]
#[command(name = "tutorgate", version, about = "Multi-provider LLM completion gateway")]
struct Cli {
    /** \brief SQLite database path; overrides TUTORGATE_DB. */
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief Starts the admin HTTP server.
     */
    Serve {
        /** \brief Listen address; overrides TUTORGATE_ADDR. */
        #[arg(long)]
        addr: Option<String>,
    },

    /**
     * \brief Lists registered providers.
     */
    Providers {
        #[arg(long, default_value_t = false)]
        all: bool,
    },

    /**
     * \brief Registers a provider. The backend family follows from the name.
     */
    AddProvider {
        #[arg(long)]
        name: String,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        priority: Option<i64>,
        #[arg(long, default_value_t = false)]
        default: bool,
        /** \brief Also seed the well-known models for this provider. */
        #[arg(long, default_value_t = false)]
        seed_models: bool,
    },

    /**
     * \brief Seeds the well-known providers and their models.
     */
    Seed,

    /**
     * \brief Probes one provider, or every enabled provider when none is named.
     */
    Test {
        provider: Option<String>,
    },

    /**
     * \brief Sends one completion and prints the reply.
     */
    Chat {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        system: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        temperature: Option<f64>,
        #[arg(long)]
        max_tokens: Option<u32>,
    },

    /**
     * \brief Turns the on-disk event log on or off.
     */
    Telemetry {
        #[arg(value_parser = clap::builder::BoolishValueParser::new())]
        enabled: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = GatewayConfig::from_env();
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    telemetry::init(&config.log_filter);
    telemetry::set_log_dir(&config.log_dir);

    let registry = Registry::open(&config).context("open registry failed")?;
    let telemetry_enabled = registry.telemetry_enabled().unwrap_or(false);
    telemetry::set_enabled(telemetry_enabled);

    match cli.command {
        Commands::Serve { addr } => {
            let addr = addr.unwrap_or(config.listen_addr);
            let gateway = Gateway::new(registry).context("build gateway failed")?;
            println!("Server listening on http://{}", addr);
            server::run(&addr, Arc::new(gateway)).await?;
        }
        Commands::Providers { all } => {
            let providers = registry.get_providers(all).context("list providers failed")?;
            if providers.is_empty() {
                println!("No providers. Run: tutorgate seed");
            }
            for p in providers {
                println!(
                    "{:>3}  {:<12} {:<18} prio={:<4} {}{} health={} requests={} tokens={} errors={}",
                    p.id,
                    p.name,
                    p.family,
                    p.priority,
                    if p.is_enabled { "enabled" } else { "disabled" },
                    if p.is_default { " default" } else { "" },
                    p.health.status.as_str(),
                    p.usage.total_requests,
                    p.usage.total_tokens,
                    p.usage.total_errors,
                );
            }
        }
        Commands::AddProvider {
            name,
            base_url,
            api_key,
            priority,
            default,
            seed_models,
        } => {
            let provider = registry
                .create_provider(ProviderInput {
                    base_url,
                    api_key,
                    priority,
                    is_default: Some(default),
                    ..ProviderInput::named(name)
                })
                .context("save provider failed")?;
            println!(
                "Saved provider id={} (name={} | {} | {})",
                provider.id,
                provider.name,
                provider.family,
                provider.base_url.as_deref().unwrap_or("-")
            );
            if seed_models {
                let inserted = registry
                    .seed_common_models(provider.id, &provider.name)
                    .context("seed models failed")?;
                println!("Seeded {} models", inserted);
            }
        }
        Commands::Seed => {
            let created = registry
                .seed_default_providers()
                .context("seed providers failed")?;
            println!("Created {} providers", created.len());
            for p in created {
                println!(
                    "  {} ({})",
                    p.name,
                    if p.is_enabled { "enabled" } else { "disabled" }
                );
            }
        }
        Commands::Test { provider } => {
            let gateway = Gateway::new(registry).context("build gateway failed")?;
            let results = match provider {
                Some(key) => vec![(key.clone(), gateway.test_provider(&key).await)],
                None => gateway.test_all_providers().await,
            };
            for (name, result) in results {
                println!(
                    "{:<12} {} {} {}",
                    name,
                    if result.success { "ok  " } else { "FAIL" },
                    result
                        .latency_ms
                        .map(|l| format!("{}ms", l))
                        .unwrap_or_else(|| "-".to_string()),
                    result.message
                );
            }
        }
        Commands::Chat {
            prompt,
            system,
            provider,
            model,
            temperature,
            max_tokens,
        } => {
            let gateway = Gateway::new(registry).context("build gateway failed")?;
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(Message::system(system));
            }
            messages.push(Message::user(prompt));
            let request = ChatRequest {
                provider,
                model,
                temperature,
                max_tokens,
                ..ChatRequest::new(messages)
            };
            let response = gateway.chat(request).await.context("chat failed")?;
            println!("{}", response.content());
            eprintln!(
                "[{} / {} | {} tokens | {} ms]",
                response.provider,
                response.model,
                response.usage.total_tokens,
                response.response_time_ms
            );
        }
        Commands::Telemetry { enabled } => {
            registry
                .set_telemetry_enabled(enabled)
                .context("save telemetry failed")?;
            println!("Telemetry {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    Ok(())
}
