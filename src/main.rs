use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::bail;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use berth::auth::{hash_password, validate_password};
use berth::config::{Config, LogFormat};
use berth::server::{AppState, create_router};
use berth::store::{ADMIN_ROLE_NAME, SqliteStore, Store};

#[derive(Parser)]
#[command(name = "berth")]
#[command(about = "A control plane for Docker Compose stacks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Administrative commands
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },

    /// Start the server. Settings come from the environment; flags override HOST and PORT.
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(long, short)]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Create the database and the first administrator
    Init {
        /// SQLite database path
        #[arg(long, env = "DATABASE_DSN", default_value = "./data/berth.db")]
        database: String,

        #[arg(long)]
        username: String,

        #[arg(long, default_value = "")]
        email: String,

        #[arg(long, env = "BERTH_ADMIN_PASSWORD", hide_env_values = true)]
        password: String,
    },
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("berth=info".parse()?);
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

fn open_store(database: &str) -> anyhow::Result<SqliteStore> {
    let path = database.strip_prefix("sqlite://").unwrap_or(database);
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let store = SqliteStore::new(path)?;
    store.initialize()?;
    Ok(store)
}

fn run_init(database: &str, username: &str, email: &str, password: &str) -> anyhow::Result<()> {
    let store = open_store(database)?;

    let Some(admin_role) = store.get_role_by_name(ADMIN_ROLE_NAME)? else {
        bail!("Database is missing the '{ADMIN_ROLE_NAME}' role");
    };
    for user in store.list_users()? {
        if store.user_is_admin(user.id)? {
            bail!(
                "Server already initialized. Administrator '{}' exists.",
                user.username
            );
        }
    }

    validate_password(password)?;
    let user = store.create_user(username, email, &hash_password(password)?)?;
    store.assign_role(user.id, admin_role.id)?;

    println!();
    println!("========================================");
    println!("Created administrator '{}' in {database}", user.username);
    println!("========================================");
    println!();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}

async fn serve(host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    init_tracing(config.logging.format)?;

    let store = open_store(&config.database_dsn)?;
    if store.count_users()? == 0 {
        warn!("No users exist yet. Run 'berth admin init' to create the first administrator.");
    }

    let addr = config.server.socket_addr()?;
    let state = Arc::new(AppState::new(config, Arc::new(store))?);
    let cancel = CancellationToken::new();
    let tasks = state.spawn_background(&cancel)?;

    let app = create_router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting server on {}", addr);

    let stopping = state.clone();
    let stop = cancel.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        stop.cancel();
        // Long-lived sockets hold the server open until they are told to go.
        stopping.hub.close();
        stopping.supervisor.shutdown();
    })
    .await?;

    info!("Server shutting down");
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task failed: {e}");
        }
    }
    state.shutdown().await;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Admin { command } => match command {
            AdminCommands::Init {
                database,
                username,
                email,
                password,
            } => {
                init_tracing(LogFormat::Text)?;
                run_init(&database, &username, &email, &password)?;
            }
        },
        Commands::Serve { host, port } => serve(host, port).await?,
    }

    Ok(())
}
