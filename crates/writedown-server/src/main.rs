use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use writedown_api::{AppState, AppStateInner};
use writedown_db::Database;
use writedown_gateway::connection;
use writedown_gateway::dispatcher::Dispatcher;
use writedown_sync::LocalStore;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Clone)]
struct GatewayState {
    dispatcher: Dispatcher,
    db: Arc<Database>,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "writedown=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret = std::env::var("WRITEDOWN_JWT_SECRET").unwrap_or_default();
    if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
        anyhow::bail!(
            "WRITEDOWN_JWT_SECRET is unset or still a placeholder; \
             it must match the identity provider's signing secret"
        );
    }
    let db_path: PathBuf = std::env::var("WRITEDOWN_DB_PATH")
        .unwrap_or_else(|_| "writedown.db".into())
        .into();
    let host = std::env::var("WRITEDOWN_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("WRITEDOWN_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let page_size: u32 = std::env::var("WRITEDOWN_PAGE_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|n| *n > 0)
        .unwrap_or(50);

    // Store: documents in SQLite, changes through the dispatcher
    let db = Arc::new(Database::open(&db_path)?);
    let dispatcher = Dispatcher::new();
    let store = LocalStore::new(db.clone(), dispatcher.clone());

    let app_state: AppState = Arc::new(AppStateInner {
        store,
        jwt_secret: jwt_secret.clone(),
        page_size,
    });

    let gateway = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(GatewayState {
            dispatcher,
            db,
            jwt_secret,
        });

    let app = Router::new()
        .merge(writedown_api::routes(app_state))
        .merge(gateway)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("WriteDown server listening on {} (db {})", addr, db_path.display());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(
    State(state): State<GatewayState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.dispatcher, state.db, state.jwt_secret)
    })
}
