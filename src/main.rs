mod config;
mod error;
mod models;
mod providers;
mod relay;
mod schedule;
mod service;
mod storage;
mod tracker;
mod ui;
mod web;

use clap::{Parser, Subcommand};
use config::{ensure_initialized, load_config, set_api_key};
use error::AppError;
use models::{Source, UsagePatch, UsageView};
use service::QuotaService;
use std::sync::Arc;
use tracker::{serialize_record, QuotaTracker};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use ui::run::run_tui;
use web::ApiState;

#[derive(Debug, Parser)]
#[command(name = "quota-meter")]
#[command(about = "Multi-window LLM quota tracker")]
struct Cli {
    /// Enable debug logging on stderr
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init,
    Show {
        #[arg(long)]
        json: bool,
    },
    Add {
        #[arg(allow_hyphen_values = true)]
        tokens: String,
    },
    Set {
        #[arg(long)]
        session: Option<f64>,
        #[arg(long)]
        daily: Option<f64>,
        #[arg(long)]
        weekly: Option<f64>,
        #[arg(long)]
        monthly: Option<f64>,
        #[arg(long)]
        session_limit: Option<f64>,
        #[arg(long)]
        daily_limit: Option<f64>,
        #[arg(long)]
        weekly_limit: Option<f64>,
        #[arg(long)]
        monthly_limit: Option<f64>,
        #[arg(long, default_value = "manual")]
        source: String,
    },
    Relay {
        text: String,
    },
    Poll,
    SetKey {
        #[arg(long)]
        api_key: String,
    },
    Export {
        #[arg(long, default_value = "json")]
        format: String,
    },
    Tui,
    Serve {
        #[arg(long)]
        listen: Option<String>,
    },
}

fn setup_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("quota_meter=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("quota_meter=warn"))
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

fn parse_tokens(raw: &str) -> Result<f64, AppError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| AppError::InvalidInput("tokens must be a number".into()))
}

fn parse_source(raw: &str) -> Result<Source, AppError> {
    raw.parse::<Source>().map_err(AppError::Config)
}

fn build_patch(pairs: &[(&str, Option<f64>, Option<f64>)]) -> UsagePatch {
    let mut patch = UsagePatch::default();
    for (key, used, limit) in pairs {
        if let Some(used) = used {
            patch = patch.set_used(key, *used);
        }
        if let Some(limit) = limit {
            patch = patch.set_limit(key, *limit);
        }
    }
    patch
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn print_view(view: &UsageView, order: &[String]) {
    println!(
        "{:<10} {:>14} {:>8}  resets in",
        "period", "used/limit", "percent"
    );
    for key in order {
        if let Some(w) = view.window(key) {
            println!(
                "{:<10} {:>14} {:>7}%  {}",
                key,
                format!("{}/{}", w.used, w.limit),
                w.percent,
                w.resets_in
            );
        }
    }
    println!(
        "source: {}  ·  last updated: {}",
        view.source.as_label(),
        view.last_updated.to_rfc3339()
    );
}

fn period_order(tracker: &QuotaTracker) -> Vec<String> {
    tracker.periods().iter().map(|p| p.key.clone()).collect()
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();
    setup_logging(cli.debug);

    match cli.command {
        Commands::Init => {
            ensure_initialized()?;
            println!("Initialized quota-meter config and data directories.");
        }
        Commands::Show { json } => {
            let cfg = load_config()?;
            let tracker = QuotaTracker::from_config(&cfg)?;
            let view = tracker.read()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print_view(&view, &period_order(&tracker));
            }
        }
        Commands::Add { tokens } => {
            let tokens = parse_tokens(&tokens)?;
            let cfg = load_config()?;
            let tracker = QuotaTracker::from_config(&cfg)?;
            let view = tracker.add_usage(tokens)?;
            print_view(&view, &period_order(&tracker));
        }
        Commands::Set {
            session,
            daily,
            weekly,
            monthly,
            session_limit,
            daily_limit,
            weekly_limit,
            monthly_limit,
            source,
        } => {
            let source = parse_source(&source)?;
            let patch = build_patch(&[
                ("session", session, session_limit),
                ("daily", daily, daily_limit),
                ("weekly", weekly, weekly_limit),
                ("monthly", monthly, monthly_limit),
            ]);
            let cfg = load_config()?;
            let tracker = QuotaTracker::from_config(&cfg)?;
            let view = if patch.is_empty() {
                eprintln!("No period values given; nothing changed.");
                tracker.read()?
            } else {
                tracker.set_usage(&patch, source)?
            };
            print_view(&view, &period_order(&tracker));
        }
        Commands::Relay { text } => {
            let cfg = load_config()?;
            let tracker = QuotaTracker::from_config(&cfg)?;
            let view = tracker.update_from_text(&text)?;
            print_view(&view, &period_order(&tracker));
        }
        Commands::Poll => {
            let cfg = load_config()?;
            let tracker = QuotaTracker::from_config(&cfg)?;
            let svc = QuotaService::new()?;
            let view = svc.poll(&cfg, &tracker).await?;
            print_view(&view, &period_order(&tracker));
        }
        Commands::SetKey { api_key } => {
            ensure_initialized()?;
            set_api_key(&api_key)?;
            println!("API key stored in the system keyring.");
        }
        Commands::Export { format } => {
            let cfg = load_config()?;
            let tracker = QuotaTracker::from_config(&cfg)?;
            let view = tracker.read()?;
            if format.eq_ignore_ascii_case("json") {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else if format.eq_ignore_ascii_case("csv") {
                println!("period,used,limit,percent,remaining,resets_at,resets_in");
                for key in period_order(&tracker) {
                    if let Some(w) = view.window(&key) {
                        println!(
                            "{},{},{},{},{},{},{}",
                            csv_field(&key),
                            w.used,
                            w.limit,
                            w.percent,
                            w.remaining,
                            csv_field(&w.resets_at.to_rfc3339()),
                            csv_field(&w.resets_in),
                        );
                    }
                }
            } else if format.eq_ignore_ascii_case("state") {
                println!("{}", serialize_record(&tracker.load())?);
            } else {
                return Err(AppError::Config(
                    "Unsupported export format. Use json, csv or state".into(),
                ));
            }
        }
        Commands::Tui => {
            ensure_initialized()?;
            let cfg = load_config()?;
            run_tui(&cfg).await?;
        }
        Commands::Serve { listen } => {
            ensure_initialized()?;
            let cfg = load_config()?;
            let listen = listen.unwrap_or_else(|| cfg.listen.clone());
            let state = Arc::new(ApiState {
                tracker: QuotaTracker::from_config(&cfg)?,
                service: QuotaService::new()?,
                config: cfg,
            });
            web::serve(state, &listen).await?;
        }
    }

    Ok(())
}
