use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use floodgate::config::FloodgateConfig;
use floodgate::gate::{Admission, AdmissionGate, RequestContext};
use floodgate::monitor::{AlertSink, LogSink, Monitor, WebhookSink};
use floodgate::ratelimit::{DistributedLimiter, Identity, Limiter, PolicyStore, Preset};

#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about = "Admission control and rate limiting")]
struct Cli {
    /// Service configuration file (YAML or JSON)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate a policy document
    Validate { file: PathBuf },

    /// Print a built-in policy preset
    Preset {
        /// default, production or development
        name: String,
        #[arg(long, value_enum, default_value_t = OutputFormat::Yaml)]
        format: OutputFormat,
    },

    /// Show the policy that applies to an endpoint
    Resolve {
        endpoint: String,
        /// Policy document; defaults to the policies in --config
        #[arg(long)]
        policies: Option<PathBuf>,
    },

    /// Run requests through the admission gate and print each decision
    Check {
        endpoint: String,
        #[arg(long, default_value = "127.0.0.1")]
        ip: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long, default_value = "GET")]
        method: String,
        #[arg(long, default_value_t = 1)]
        count: u32,
    },

    /// Probe the coordinator and print the monitor's health report
    Health,

    /// Delete coordinator keys that carry no TTL
    Cleanup,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<FloodgateConfig> {
    match path {
        Some(path) => FloodgateConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Ok(FloodgateConfig::default()),
    }
}

fn alert_sinks(config: &FloodgateConfig) -> anyhow::Result<Vec<Arc<dyn AlertSink>>> {
    let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogSink)];
    if let Some(url) = &config.monitor.webhook_url {
        sinks.push(Arc::new(WebhookSink::new(url.clone())?));
    }
    Ok(sinks)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Validate { file } => {
            let store = PolicyStore::from_file(&file)
                .with_context(|| format!("{} is not a valid policy document", file.display()))?;
            println!(
                "{}: ok ({} endpoint policies, default {} per {})",
                file.display(),
                store.endpoint_limits.len(),
                store.default_limit,
                floodgate::duration::format(store.default_window)
            );
        }

        Command::Preset { name, format } => {
            let Some(preset) = Preset::from_name(&name) else {
                bail!("unknown preset '{}': expected default, production or development", name);
            };
            let store = preset.build();
            let rendered = match format {
                OutputFormat::Yaml => store.to_yaml()?,
                OutputFormat::Json => store.to_json()?,
            };
            println!("{}", rendered);
        }

        Command::Resolve { endpoint, policies } => {
            let store = match policies {
                Some(path) => PolicyStore::from_file(&path)?,
                None => load_config(cli.config.as_ref())?.policies,
            };
            let policy = store.get_endpoint_limit(&endpoint);
            println!("{}", serde_yaml::to_string(policy.as_ref())?);
        }

        Command::Check {
            endpoint,
            ip,
            user,
            method,
            count,
        } => {
            let config = load_config(cli.config.as_ref())?;
            let monitor = Arc::new(Monitor::start(
                config.monitor.clone(),
                alert_sinks(&config)?,
                None,
            ));
            let gate = AdmissionGate::from_config(&config, Some(monitor.clone()))?;

            let mut identity = Identity::from_ip(ip);
            if let Some(user) = user {
                identity = identity.with_user(user);
            }
            let request = RequestContext::new(method, endpoint, identity);

            for _ in 0..count {
                match gate.admit(&request).await? {
                    Admission::Bypassed => println!("bypassed"),
                    Admission::Skipped => println!("skipped"),
                    Admission::Decided {
                        decision, source, ..
                    } => println!("{}", serde_json::to_string(&serde_json::json!({
                        "source": source,
                        "decision": decision,
                    }))?),
                }
            }

            gate.shutdown().await;
            monitor.shutdown().await;
        }

        Command::Health => {
            let config = load_config(cli.config.as_ref())?;
            let limiter: Arc<dyn Limiter> = Arc::new(DistributedLimiter::new(
                &config.coordinator,
                &config.policies.key_prefix,
            )?);
            let monitor = Monitor::start(config.monitor.clone(), Vec::new(), Some(limiter));
            let status = monitor.health_status().await;
            monitor.shutdown().await;

            println!("{}", serde_json::to_string_pretty(&status)?);
            if !status.limiter_healthy {
                std::process::exit(1);
            }
        }

        Command::Cleanup => {
            let config = load_config(cli.config.as_ref())?;
            let limiter = DistributedLimiter::connect(&config.coordinator, &config.policies.key_prefix)
                .await
                .context("coordinator unavailable")?;
            let deleted = limiter.cleanup().await?;
            info!(deleted, "Cleanup finished");
            println!("deleted {} keys without TTL", deleted);
        }
    }

    Ok(())
}
