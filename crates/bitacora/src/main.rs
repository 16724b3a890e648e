use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{filter::Directive, fmt, EnvFilter};

mod auth;
mod config;
mod db;
mod error;
mod export;
mod extracts;
mod html;
mod kpi;
mod parser;
mod server;
mod store;
mod types;

use config::{Config, StoreKind};

#[derive(Parser, Debug)]
#[command(name = "bitacora")]
#[command(about = "Maternal health audit log and KPI dashboard for monthly extracts")]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Directory holding users, audits and uploaded extracts
    #[arg(short, long, env = "BITACORA_DATA_DIR", default_value = "data", global = true)]
    data_dir: PathBuf,

    /// Audit storage backend
    #[arg(long, env = "BITACORA_STORE", value_enum, default_value = "json", global = true)]
    store: StoreKind,

    /// Secret used to encrypt session cookies
    #[arg(long, env = "BITACORA_SESSION_SECRET", hide_env_values = true, global = true)]
    session_secret: Option<String>,

    /// Password for the initial admin account, used only while there are no users
    #[arg(long, env = "BITACORA_ADMIN_PASSWORD", hide_env_values = true, global = true)]
    admin_password: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "BITACORA_PORT", default_value = "8080", global = true)]
    port: u16,

    /// Address to bind
    #[arg(long, env = "BITACORA_BIND", default_value = "127.0.0.1", global = true)]
    bind: IpAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the web server (default)
    Serve,

    /// Compute indicators for an extract file
    Kpi {
        /// Path to the extract (.xlsx, .xls, .ods or SpreadsheetML .xml)
        file: PathBuf,

        #[arg(long)]
        ips: Option<String>,

        #[arg(long)]
        municipality: Option<String>,

        /// Month to select (YYYY-MM)
        #[arg(long)]
        month: Option<String>,

        /// Also write the report as CSV
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Create a user account
    UserAdd {
        username: String,

        #[arg(long)]
        full_name: String,

        /// admin or user
        #[arg(long, default_value = "user")]
        role: String,

        /// Job title printed under the signature
        #[arg(long, default_value = "")]
        position: String,

        #[arg(long, env = "BITACORA_NEW_USER_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Write every audit to a CSV file
    ExportAudits {
        /// Output path
        #[arg(default_value = "auditorias.csv")]
        out: PathBuf,
    },
}

fn init_tracing(log_level: &str) {
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    for directive in ["hyper=warn", "tower_http=warn"] {
        if let Ok(directive) = directive.parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_max_level(Level::TRACE)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    init_tracing(&args.log_level);

    let config = Config {
        data_dir: args.data_dir,
        store: args.store,
        session_secret: args.session_secret,
        admin_password: args.admin_password,
    };

    match args.command {
        // Default to serve if no command specified
        None | Some(Commands::Serve) => {
            server::serve(&config, args.bind, args.port).await?;
        }
        Some(Commands::Kpi {
            file,
            ips,
            municipality,
            month,
            csv,
        }) => {
            let filter = kpi::Filter {
                ips,
                municipality,
                month,
            }
            .normalized();
            filter.month_start().map_err(anyhow::Error::msg)?;

            let table = parser::read_table(&file)?;
            let source = file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            let report = kpi::compute(&table, &filter, source);

            info!(
                file = %file.display(),
                selected = report.selected_rows,
                total = report.total_rows,
                "Rows selected"
            );
            for indicator in &report.indicators {
                info!(
                    key = %indicator.key,
                    column = indicator.column.as_deref().unwrap_or("-"),
                    numerator = indicator.numerator,
                    denominator = indicator.denominator,
                    percentage = indicator.percentage,
                    "{}",
                    indicator.label
                );
            }

            if let Some(path) = csv {
                std::fs::write(&path, export::kpi_csv(&report)?)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                info!(path = %path.display(), "CSV saved");
            }
        }
        Some(Commands::UserAdd {
            username,
            full_name,
            role,
            position,
            password,
        }) => {
            std::fs::create_dir_all(&config.data_dir)
                .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;
            let users = store::UserStore::open(config.users_path());
            let user = users.create(types::NewUser {
                username,
                password,
                full_name,
                role,
                position,
                signature: None,
            })?;
            info!(username = %user.username, role = %user.role, id = %user.id, "User created");
        }
        Some(Commands::ExportAudits { out }) => {
            let audits = store::open_audit_store(config.store, &config.data_dir)?
                .list(&store::AuditQuery::default())?;
            std::fs::write(&out, export::audits_csv(&audits)?)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            info!(count = audits.len(), path = %out.display(), "Audits exported");
        }
    }

    Ok(())
}
