use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::Context as _;
use axum::{extract::FromRef, routing::get, Router};
use clap::Parser;
use clap_verbosity_flag::{log::LevelFilter, InfoLevel, Verbosity};
use figment::{providers::Format as _, Figment};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    config::AppConfig,
    db::{establish_pool, Db},
    endpoints::{self, users::insert_user},
    geo::{SqlLocator, UserLocator},
    mailer::{HttpMailer, Mailer},
    models::Role,
    Error,
};

/// The application user agent. Concatenates the package name and version. e.g. `reliefhub/0.1.0`.
pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

/// The application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Parser, Debug, Clone)]
/// Command line arguments.
pub struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "default.toml")]
    pub config: PathBuf,
    /// The verbosity level.
    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}

#[derive(Clone, FromRef)]
/// The application state, shared across all routes.
pub struct AppState {
    /// The application configuration.
    pub config: AppConfig,
    /// The database connection pool.
    pub db: Db,
    /// Outbound email for alert fan-out.
    pub mailer: Arc<dyn Mailer>,
    /// Resolves which users sit inside an alert radius.
    pub locator: Arc<dyn UserLocator>,
}

impl AppState {
    /// Build the state from a loaded configuration and an open pool.
    pub fn new(config: AppConfig, db: Db, client: reqwest::Client) -> Self {
        let mailer = HttpMailer::new(client, &config.email);
        Self {
            locator: Arc::new(SqlLocator::new(db.clone())),
            mailer: Arc::new(mailer),
            config,
            db,
        }
    }
}

/// The full HTTP application.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(crate::index))
        .nest("/api", endpoints::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Create the configured administrator if no administrator exists yet.
/// Returns the issued token on creation.
async fn bootstrap_admin(state: &AppState) -> anyhow::Result<Option<String>> {
    let Some(admin) = &state.config.bootstrap_admin else {
        return Ok(None);
    };

    let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE role = 'admin'")
        .fetch_one(&state.db)
        .await
        .context("failed to count administrators")?;
    if existing > 0 {
        return Ok(None);
    }

    let (_, token) = insert_user(&state.db, &admin.name, &admin.email, Role::Admin, None, None, &[])
        .await
        .map_err(|e| anyhow::anyhow!("failed to create bootstrap admin: {e}"))?;
    Ok(Some(token))
}

/// The main application entry point.
pub async fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    // Set up trace logging to console and account for the user-provided verbosity flag.
    if args.verbosity.log_level_filter() != LevelFilter::Off {
        let lvl = match args.verbosity.log_level_filter() {
            LevelFilter::Error => tracing::Level::ERROR,
            LevelFilter::Warn => tracing::Level::WARN,
            LevelFilter::Info | LevelFilter::Off => tracing::Level::INFO,
            LevelFilter::Debug => tracing::Level::DEBUG,
            LevelFilter::Trace => tracing::Level::TRACE,
        };
        tracing_subscriber::fmt().with_max_level(lvl).init();
    }

    if !args.config.exists() {
        // Not fatal: every setting can also come from the environment.
        warn!(
            "configuration file {} does not exist",
            args.config.display()
        );
    }

    // Read and parse the user-provided configuration.
    let config: AppConfig = Figment::new()
        .admerge(figment::providers::Toml::file(args.config))
        .admerge(figment::providers::Env::prefixed("RELIEFHUB_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    if config.workflow.guard_transitions {
        info!("verification transitions are guarded");
    } else {
        warn!("verification transitions are unguarded; concurrent approvals may both fan out");
    }

    // Initialize metrics reporting.
    crate::metrics::setup(config.metrics.as_ref()).context("failed to set up metrics exporter")?;

    // Create a reqwest client that will be used for all outbound requests.
    let client = reqwest::Client::builder()
        .user_agent(APP_USER_AGENT)
        .build()
        .context("failed to build requester client")?;

    let pool = establish_pool(&config.db)
        .await
        .context("failed to establish database connection pool")?;

    let addr = config
        .listen_address
        .unwrap_or(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000));

    let state = AppState::new(config, pool, client);

    if let Some(token) = bootstrap_admin(&state).await? {
        // N.B: This is a sensitive message, so we're bypassing `tracing` here and
        // logging it directly to console.
        println!("=====================================");
        println!("            FIRST STARTUP            ");
        println!("=====================================");
        println!("Administrator token (shown once):");
        println!("{token}");
        println!("=====================================");
    }

    info!("listening on {addr}");
    info!("connect to: http://127.0.0.1:{}", addr.port());

    let listener = TcpListener::bind(&addr)
        .await
        .context("failed to bind address")?;

    axum::serve(listener, app(state).into_make_service())
        .await
        .context("failed to serve app")
}
