//! # Leadflow: signup segmentation and email sequencing
//!
//! Usage:
//!   leadflow serve                         # Start the webhook gateway and delivery engine
//!   leadflow serve --port 9000 --fast-mode # Compressed cadence for testing
//!   leadflow classify --red 1 --orange 2   # Preview a lead's segment and sequence
//!   leadflow check-config                  # Validate config, secrets, and templates

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use leadflow_channels::{TemplateStore, sender_from_config};
use leadflow_core::config::{LeadflowConfig, expand_path};
use leadflow_core::traits::SecretSource;
use leadflow_core::types::{Segment, SystemCounts};
use leadflow_gateway::AppState;
use leadflow_router::{IntakeHandler, SegmentClassifier, TemplateRouter};
use leadflow_scheduler::{
    AlertDispatcher, DeliveryEngine, SchedulerDb, spawn_engine, targets_from_config,
};
use leadflow_security::secrets_from_config;

#[derive(Parser)]
#[command(
    name = "leadflow",
    version,
    about = "📬 Leadflow: signup segmentation and email sequencing"
)]
struct Cli {
    /// Config file (default: ~/.leadflow/config.toml)
    #[arg(short, long, env = "LEADFLOW_CONFIG")]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the webhook gateway and the delivery engine
    Serve {
        /// Override gateway.port
        #[arg(short, long)]
        port: Option<u16>,

        /// Divide every step offset by sequence.fast_mode_divisor
        #[arg(long)]
        fast_mode: bool,
    },
    /// Show the segment and template sequence for a set of counts
    Classify {
        #[arg(long, default_value = "0")]
        red: u32,
        #[arg(long, default_value = "0")]
        orange: u32,
        #[arg(long, default_value = "0")]
        yellow: u32,
        #[arg(long, default_value = "0")]
        green: u32,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Validate config, secrets, and template files, then exit
    CheckConfig,
}

fn init_logging(verbose: bool, json: bool) {
    let default = if verbose {
        "leadflow=debug,leadflow_router=debug,leadflow_scheduler=debug,tower_http=debug"
    } else {
        "leadflow=info,leadflow_router=info,leadflow_scheduler=info,leadflow_gateway=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&str>) -> Result<LeadflowConfig> {
    let config = match path {
        Some(p) => {
            let path: PathBuf = expand_path(p);
            tracing::info!("📄 Config: {}", path.display());
            LeadflowConfig::load_from(&path)?
        }
        None => LeadflowConfig::load()?,
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs);

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { port, fast_mode } => {
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if fast_mode {
                config.sequence.fast_mode = true;
                config.validate()?;
            }
            serve(config).await
        }
        Command::Classify {
            red,
            orange,
            yellow,
            green,
            json,
        } => classify(&config, SystemCounts::new(red, orange, yellow, green), json),
        Command::CheckConfig => check_config(&config),
    }
}

async fn serve(config: LeadflowConfig) -> Result<()> {
    let secrets = secrets_from_config(&config.secrets)?;

    let db_path = expand_path(&config.storage.db_path);
    let db = Arc::new(SchedulerDb::open(&db_path).map_err(|e| anyhow::anyhow!("{e}"))?);
    tracing::info!("🗄️ Database: {}", db_path.display());

    let sender = sender_from_config(&config.email, &secrets)?;
    let targets = targets_from_config(&config.alert, &secrets)?;
    let alerts = Arc::new(AlertDispatcher::new(targets, &config.campaign));
    tracing::info!("🚨 Alert targets: {}", alerts.target_count());

    let intake = IntakeHandler::from_config(&config, db.clone(), db.clone(), alerts)?;

    let engine = Arc::new(DeliveryEngine::new(
        db.clone(),
        sender,
        config.engine.clone(),
        config.retry.clone(),
    ));
    let _engine = spawn_engine(engine);

    if config.sequence.fast_mode {
        tracing::warn!(
            "⏩ Fast mode: step offsets divided by {}",
            config.sequence.fast_mode_divisor
        );
    }

    let webhook_secret = secrets.lookup("WEBHOOK_SECRET");
    if webhook_secret.is_none() {
        tracing::warn!("⚠️ WEBHOOK_SECRET not set, inbound webhooks are unsigned");
    }

    println!("📬 Leadflow v{}", env!("CARGO_PKG_VERSION"));
    println!("   🎯 Campaign:  {}", config.campaign);
    println!(
        "   🌐 Webhook:   http://{}:{}/webhook/signup",
        config.gateway.host, config.gateway.port
    );
    println!("   📧 Provider:  {}", config.email.provider);
    println!();

    let state = AppState::new(config.gateway.clone(), Arc::new(intake), webhook_secret);
    leadflow_gateway::start(state).await
}

fn classify(config: &LeadflowConfig, counts: SystemCounts, json: bool) -> Result<()> {
    let classifier = SegmentClassifier::new(config.classifier);
    let router = TemplateRouter::from_config(&config.templates)?;
    let segment = classifier.classify(&counts);
    let sequence = router.sequence_for(segment);

    if json {
        let steps: Vec<_> = sequence
            .iter()
            .map(|(step, template)| serde_json::json!({"step": step, "template": template}))
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "segment": segment.label(),
                "priority": segment.priority(),
                "alert": router.should_alert(segment),
                "sequence": steps,
            }))?
        );
        return Ok(());
    }

    println!("{} (priority {}): {}", segment.label(), segment.priority(), segment.description());
    if router.should_alert(segment) {
        println!("🚨 Triggers an alert");
    }
    for (step, template) in sequence {
        println!("   {step}. {template}");
    }
    Ok(())
}

fn check_config(config: &LeadflowConfig) -> Result<()> {
    let router = TemplateRouter::from_config(&config.templates)?;
    let offsets = config.sequence.scaled_offsets()?;
    println!("✅ Config valid: campaign '{}', {} steps", config.campaign, offsets.len());

    let secrets = secrets_from_config(&config.secrets)?;
    let mut problems = Vec::new();

    if let Err(e) = sender_from_config(&config.email, &secrets) {
        problems.push(format!("email: {e}"));
    }
    if let Err(e) = targets_from_config(&config.alert, &secrets) {
        problems.push(format!("alert: {e}"));
    }

    if config.email.provider == "smtp" {
        let store = TemplateStore::new(expand_path(&config.email.templates_dir));
        let mut ids: Vec<&str> = Segment::ALL
            .iter()
            .flat_map(|s| router.sequence_for(*s))
            .map(|(_, t)| t)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        for id in store.missing(ids) {
            problems.push(format!(
                "template file missing: {}",
                store.dir().join(format!("{id}.txt")).display()
            ));
        }
    }

    if problems.is_empty() {
        println!("✅ Secrets and templates resolved");
        return Ok(());
    }
    for p in &problems {
        println!("❌ {p}");
    }
    anyhow::bail!("{} problem(s) found", problems.len())
}
