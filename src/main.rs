use alerter::{run_alerter_service, TelegramAlerter};
use anyhow::Context;
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use configuration::{Settings, StorageBackend, SupervisorMode};
use database::{DbRepository, MemoryStore, Store};
use engine::{advisor_from_settings, ControlPlane, SystemClock};
use events::BroadcastPublisher;
use risk::RiskExposure;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;
use web_server::AppState;

/// The Warden executor command & control plane.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file. Defaults to `./config.toml` when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WebSocket server with the reaper and risk monitor.
    Serve(ServeArgs),
    /// Apply pending database migrations and exit.
    Migrate,
    /// Register an executor and print its one-time credentials.
    RegisterExecutor {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        name: String,
    },
    /// Print a user's current risk exposure.
    Exposure {
        #[arg(long)]
        user: Uuid,
    },
    /// Send EMERGENCY_STOP to every executor a user owns.
    EmergencyStop {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Parser)]
struct ServeArgs {
    /// Keep everything in memory instead of PostgreSQL.
    #[arg(long)]
    in_memory: bool,

    /// Overrides `server.addr`.
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Overrides `supervisor.mode`.
    #[arg(long, value_enum)]
    supervisor: Option<SupervisorMode>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = configuration::load_config(cli.config.as_deref())?;
    // Held until exit so the file writer flushes.
    let _guard = configuration::init_tracing(&settings.logging)?;

    match cli.command {
        Commands::Serve(args) => {
            if args.in_memory {
                settings.storage.backend = StorageBackend::Memory;
            }
            if let Some(mode) = args.supervisor {
                settings.supervisor.mode = mode;
            }
            serve(settings, args.addr).await
        }
        Commands::Migrate => {
            let pool = database::connect(&settings.database).await?;
            database::run_migrations(&pool).await?;
            println!("Migrations applied.");
            Ok(())
        }
        Commands::RegisterExecutor { user, name } => {
            let (control, _) = control_plane(settings).await?;
            let registered = control.executors.register(user, &name).await?;
            println!("Executor registered: {}", registered.executor.executor.id);
            println!("  API key:    {}", registered.api_key);
            println!("  API secret: {}", registered.api_secret);
            println!("The secret is not stored in plaintext and cannot be shown again.");
            Ok(())
        }
        Commands::Exposure { user } => {
            let (control, _) = control_plane(settings).await?;
            let exposure = control.exposure.compute_exposure(user).await?;
            print_exposure(&exposure);
            Ok(())
        }
        Commands::EmergencyStop { user, reason } => {
            let (control, _) = control_plane(settings).await?;
            let report = control.emergency.emergency_stop(user, reason).await?;
            println!("{}", report.notice);
            for id in report.command_ids() {
                println!("  command {id}");
            }
            for id in &report.failed {
                println!("  FAILED executor {id}");
            }
            Ok(())
        }
    }
}

async fn serve(settings: Settings, addr: Option<SocketAddr>) -> anyhow::Result<()> {
    let addr = match addr {
        Some(addr) => addr,
        None => settings
            .server
            .addr
            .parse()
            .with_context(|| format!("invalid server.addr '{}'", settings.server.addr))?,
    };

    let alerter = TelegramAlerter::new(&settings.alerts);
    let (control, publisher) = control_plane(settings).await?;
    let control = Arc::new(control);

    match alerter {
        Some(alerter) => {
            tokio::spawn(run_alerter_service(alerter, publisher.subscribe_all()));
        }
        None => tracing::info!("Telegram alerts disabled."),
    }
    let background = control.spawn_background();
    tracing::info!(
        tasks = background.len(),
        supervisor = ?control.supervisor.mode(),
        "Control plane started."
    );

    let state = Arc::new(AppState::new(control, publisher));
    tokio::select! {
        result = web_server::run_server(state, addr) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received."),
    }

    for task in background {
        task.abort();
    }
    Ok(())
}

/// Opens the configured store and assembles the control plane on top of it.
async fn control_plane(settings: Settings) -> anyhow::Result<(ControlPlane, BroadcastPublisher)> {
    let store: Arc<dyn Store> = match settings.storage.backend {
        StorageBackend::Memory => {
            tracing::warn!("Using the in-memory store; nothing survives a restart.");
            Arc::new(MemoryStore::new())
        }
        StorageBackend::Postgres => {
            let pool = database::connect(&settings.database).await?;
            database::run_migrations(&pool).await?;
            Arc::new(DbRepository::new(pool))
        }
    };

    let publisher = BroadcastPublisher::default();
    let advisor = advisor_from_settings(&settings.supervisor)?;
    let control = ControlPlane::new(
        settings,
        store,
        Arc::new(publisher.clone()),
        Arc::new(SystemClock),
        advisor,
    )?;
    Ok((control, publisher))
}

fn print_exposure(exposure: &RiskExposure) {
    let mut summary = Table::new();
    summary.load_preset(UTF8_FULL).set_header(vec!["Metric", "Value"]);
    summary.add_row(vec!["Balance".to_string(), exposure.balance.to_string()]);
    summary.add_row(vec!["Equity".to_string(), exposure.equity.to_string()]);
    summary.add_row(vec!["Used margin".to_string(), exposure.used_margin.to_string()]);
    summary.add_row(vec!["Free margin".to_string(), exposure.free_margin.to_string()]);
    summary.add_row(vec!["Margin level %".to_string(), exposure.margin_level.to_string()]);
    summary.add_row(vec!["Open positions".to_string(), exposure.open_position_count.to_string()]);
    summary.add_row(vec!["Total lots".to_string(), exposure.total_lots.to_string()]);
    summary.add_row(vec!["Unrealized P&L".to_string(), exposure.unrealized_pnl.to_string()]);
    summary.add_row(vec!["Realized P&L today".to_string(), exposure.realized_pnl_today.to_string()]);
    summary.add_row(vec!["Daily drawdown %".to_string(), exposure.daily_drawdown_pct.to_string()]);
    summary.add_row(vec!["Risk score".to_string(), exposure.risk_score.to_string()]);
    summary.add_row(vec!["Risk level".to_string(), exposure.risk_level.to_string()]);
    println!("{summary}");

    if !exposure.by_symbol.is_empty() {
        let mut symbols = Table::new();
        symbols
            .load_preset(UTF8_FULL)
            .set_header(vec!["Symbol", "Long", "Short", "Net", "Notional", "P&L", "Positions"]);
        for (symbol, bucket) in &exposure.by_symbol {
            symbols.add_row(vec![
                symbol.clone(),
                bucket.long_lots.to_string(),
                bucket.short_lots.to_string(),
                bucket.net_lots.to_string(),
                bucket.notional.to_string(),
                bucket.unrealized_pnl.to_string(),
                bucket.position_count.to_string(),
            ]);
        }
        println!("{symbols}");
    }

    if exposure.violations.is_empty() {
        println!("No violations.");
        return;
    }
    let mut violations = Table::new();
    violations
        .load_preset(UTF8_FULL)
        .set_header(vec!["Violation", "Severity", "Value", "Threshold", "Message"]);
    for v in &exposure.violations {
        violations.add_row(vec![
            v.kind.to_string(),
            v.severity.to_string(),
            v.value.to_string(),
            v.threshold.to_string(),
            v.message.clone(),
        ]);
    }
    println!("{violations}");
}
