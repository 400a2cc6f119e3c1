use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use featureflow_config::EngineConfig;
use featureflow_core::{Engine, FilePersistenceBackend, RetentionPolicy};
use featureflow_transport::{HttpRulesTransport, PointerRequest, RulesTransport};

const CONFIG_PATH: &str = "featureflow.toml";
const STATE_DIR: &str = ".featureflow/state";

#[derive(Debug, Parser)]
#[command(name = "featureflow", version, about = "Client-side feature-flag engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write a fresh featureflow.toml in the current directory.
    Init {
        #[arg(long)]
        company: String,
        #[arg(long)]
        tenant: String,
        #[arg(long, default_value = "production")]
        environment: String,
        #[arg(long)]
        api_key: String,
        #[arg(long)]
        rules_base_url: Option<String>,
        /// Read the rule document from this local file instead of
        /// fetching it from the network (spec §4.6 local mode).
        #[arg(long)]
        local_rules_path: Option<String>,
        #[arg(long)]
        no_auto_refresh: bool,
    },
    /// Append an event, e.g. `featureflow log-event app_open plan=pro count=3`.
    LogEvent {
        name: String,
        #[arg(trailing_var_arg = true)]
        params: Vec<String>,
    },
    SetUserProp { key: String, value: String },
    #[command(name = "remove-user-prop")]
    RemoveUserProp { key: String },
    SetDeviceProp { key: String, value: String },
    #[command(name = "remove-device-prop")]
    RemoveDeviceProp { key: String },
    GetFeature { name: String },
    IsEnabled { name: String },
    /// Reset one feature, or every feature if no name is given.
    Reset { name: Option<String> },
    Refresh,
    /// Print change notifications for one feature until Ctrl-C.
    Listen { feature: String },
    ClearCache,
    ClearEventHistory,
    /// Dump the current event log.
    History,
    /// Print engine and cache diagnostics.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();

    if let Commands::Init {
        company,
        tenant,
        environment,
        api_key,
        rules_base_url,
        local_rules_path,
        no_auto_refresh,
    } = cli.command
    {
        return run_init(company, tenant, environment, api_key, rules_base_url, local_rules_path, no_auto_refresh);
    }

    let config = EngineConfig::from_toml_file(CONFIG_PATH)
        .with_context(|| format!("loading {CONFIG_PATH} (run `featureflow init` first)"))?;
    let engine = build_engine(&config).await?;

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),
        Commands::LogEvent { name, params } => {
            let parameters = parse_params(&params)?;
            engine.log_event(name, parameters).await?;
            engine.flush().await?;
            println!("event logged");
        }
        Commands::SetUserProp { key, value } => {
            engine.set_user_property(key, value).await?;
            engine.flush().await?;
            println!("user property set");
        }
        Commands::RemoveUserProp { key } => {
            engine.remove_user_property(&key).await?;
            engine.flush().await?;
            println!("user property removed");
        }
        Commands::SetDeviceProp { key, value } => {
            engine.set_device_property(key, value).await?;
            engine.flush().await?;
            println!("device property set");
        }
        Commands::RemoveDeviceProp { key } => {
            engine.remove_device_property(&key).await?;
            engine.flush().await?;
            println!("device property removed");
        }
        Commands::GetFeature { name } => match engine.get_feature_value(&name).await {
            Some(value) => println!("{value}"),
            None => println!("(absent)"),
        },
        Commands::IsEnabled { name } => {
            println!("{}", engine.is_feature_enabled(&name).await);
        }
        Commands::Reset { name } => {
            match name {
                Some(name) => engine.reset_feature(&name).await?,
                None => engine.reset_all_features().await?,
            }
            println!("reset complete");
        }
        Commands::Refresh => {
            engine.refresh_rules().await?;
            engine.flush().await?;
            println!("rules refreshed");
        }
        Commands::Listen { feature } => {
            engine
                .add_listener(feature.clone(), Arc::new(|feature, value| {
                    println!("{feature} -> {}", value.unwrap_or("(absent)"));
                }))
                .await;
            println!("listening for changes on '{feature}' (Ctrl-C to stop)");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
        }
        Commands::ClearCache => {
            engine.clear_cache().await?;
            println!("cache cleared");
        }
        Commands::ClearEventHistory => {
            engine.clear_event_history().await?;
            println!("event history cleared");
        }
        Commands::History => {
            print_history(&config).await?;
        }
        Commands::Doctor => {
            print_doctor(&config, &engine).await;
        }
    }

    Ok(())
}

fn run_init(
    company: String,
    tenant: String,
    environment: String,
    api_key: String,
    rules_base_url: Option<String>,
    local_rules_path: Option<String>,
    no_auto_refresh: bool,
) -> Result<()> {
    let mut config = EngineConfig {
        company,
        tenant,
        environment,
        api_key,
        auto_refresh: !no_auto_refresh,
        rules_base_url: rules_base_url.unwrap_or_default(),
        local_rules_path,
        ..EngineConfig::default()
    };
    config = config.build().context("validating engine configuration")?;

    let toml = toml::to_string_pretty(&config).context("serializing featureflow.toml")?;
    std::fs::write(CONFIG_PATH, toml).with_context(|| format!("writing {CONFIG_PATH}"))?;
    println!("wrote {CONFIG_PATH}");
    Ok(())
}

async fn build_engine(config: &EngineConfig) -> Result<Engine> {
    let persistence = Arc::new(FilePersistenceBackend::new(STATE_DIR).context("opening persistence directory")?);
    let retention = RetentionPolicy::new(config.max_events, config.max_event_age_days);
    let namespace = config.namespace();

    if let Some(path) = &config.local_rules_path {
        let rules_json = std::fs::read_to_string(path).with_context(|| format!("reading local rules file {path}"))?;
        return Engine::initialize_local(namespace, persistence, retention, &rules_json).await;
    }

    if config.rules_base_url.is_empty() {
        bail!("rules_base_url must be set unless local_rules_path is configured");
    }

    let transport: Arc<dyn RulesTransport> = Arc::new(HttpRulesTransport::new().context("building HTTP transport")?);
    let pointer_request = PointerRequest {
        base_url: config.rules_base_url.clone(),
        company: config.company.clone(),
        tenant: config.tenant.clone(),
        environment: config.environment.clone(),
        api_key: config.api_key.clone(),
    };

    Engine::initialize(
        namespace,
        persistence,
        Some(transport),
        Some(pointer_request),
        retention,
        config.poll_interval_ms,
        config.auto_refresh,
    )
    .await
}

fn parse_params(raw: &[String]) -> Result<HashMap<String, featureflow_core::Value>> {
    let mut parameters = HashMap::new();
    for item in raw {
        let (key, value) = item
            .split_once('=')
            .with_context(|| format!("malformed parameter '{item}' (expected key=value)"))?;
        let parsed = serde_json::from_str::<serde_json::Value>(value)
            .map(featureflow_core::Value::from)
            .unwrap_or_else(|_| featureflow_core::Value::from(value));
        parameters.insert(key.to_string(), parsed);
    }
    Ok(parameters)
}

async fn print_history(config: &EngineConfig) -> Result<()> {
    let persistence = FilePersistenceBackend::new(STATE_DIR).context("opening persistence directory")?;
    let key = format!("{}/{}", config.namespace(), featureflow_core::persistence::keys::EVENTS);
    let events = match featureflow_core::PersistenceBackend::get(&persistence, &key)? {
        Some(bytes) => serde_json::from_slice::<Vec<featureflow_core::EventRecord>>(&bytes)
            .context("parsing persisted event log")?,
        None => Vec::new(),
    };
    println!("{} events", events.len());
    for event in events {
        println!("[{}] {} {:?}", event.timestamp, event.name, event.parameters);
    }
    Ok(())
}

async fn print_doctor(config: &EngineConfig, engine: &Engine) {
    println!("featureflow doctor");
    println!("- namespace: {}", config.namespace());
    println!("- auto_refresh: {}", config.auto_refresh);
    println!("- poll_interval_ms: {}", config.poll_interval_ms);
    println!("- max_events: {}", config.max_events);
    println!("- max_event_age_days: {}", config.max_event_age_days);
    println!("- local_rules_path: {}", config.local_rules_path.as_deref().unwrap_or("(network mode)"));
    println!("- event count: {}", engine.event_count().await);
    println!("- cached features: {}", engine.feature_snapshot().await.len());
    println!("- state directory: {}", Path::new(STATE_DIR).display());
}
