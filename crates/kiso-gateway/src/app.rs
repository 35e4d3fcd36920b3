use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use dashmap::DashMap;
use uuid::Uuid;

use kiso_core::audit::AuditLog;
use kiso_core::config::ConfigHandle;
use kiso_core::{DeploySecrets, KisoConfig};
use kiso_knowledge::KnowledgeKeeper;
use kiso_llm::LlmGateway;
use kiso_runtime::{Supervisor, WebhookDeliverer, WorkerDeps};
use kiso_store::Store;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: Arc<ConfigHandle>,
    pub store: Arc<Store>,
    pub secrets: Arc<DeploySecrets>,
    pub audit: Arc<AuditLog>,
    pub supervisor: Arc<Supervisor>,
    /// Per-token fixed-window rate counters: token name -> (minute, count).
    pub rate_windows: DashMap<String, (i64, u32)>,
    pub pub_secret: Arc<String>,
}

impl AppState {
    pub fn new(config: KisoConfig) -> anyhow::Result<Self> {
        let kiso_dir = config.kiso_dir();
        let store = Arc::new(Store::open(&kiso_dir.join("store.db"))?);
        let secrets = Arc::new(DeploySecrets::load(&kiso_dir.join(".env")));
        let audit = Arc::new(AuditLog::new(kiso_dir.join("audit")));
        let config = Arc::new(ConfigHandle::new(config));

        let gateway = Arc::new(LlmGateway::new(
            Arc::clone(&config),
            Arc::clone(&secrets),
            Arc::clone(&audit),
        ));
        let keeper = Arc::new(KnowledgeKeeper::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            Arc::clone(&config),
        ));
        let deliverer = Arc::new(WebhookDeliverer::new(Arc::clone(&config)));

        // Per-process secret: pub-file tokens die with the process, which is
        // fine — the files they point at outlive it and get fresh links.
        let pub_secret = Arc::new(Uuid::new_v4().simple().to_string());

        let snapshot = config.load();
        let public_base_url = snapshot
            .server
            .public_url
            .clone()
            .unwrap_or_else(|| {
                format!("http://{}:{}", snapshot.server.bind, snapshot.server.port)
            });

        let deps = Arc::new(WorkerDeps {
            store: Arc::clone(&store),
            config: Arc::clone(&config),
            gateway,
            deploy_secrets: Arc::clone(&secrets),
            keeper,
            deliverer,
            pub_secret: Arc::clone(&pub_secret),
            public_base_url,
        });

        Ok(Self {
            config,
            store,
            secrets,
            audit,
            supervisor: Arc::new(Supervisor::new(deps)),
            rate_windows: DashMap::new(),
            pub_secret,
        })
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/msg", post(crate::http::msg::msg_handler))
        .route("/status/{session}", get(crate::http::status::status_handler))
        .route("/sessions", post(crate::http::sessions::create_session_handler))
        .route(
            "/sessions/{session}/cancel",
            post(crate::http::sessions::cancel_handler),
        )
        .route(
            "/admin/reload-env",
            post(crate::http::admin::reload_env_handler),
        )
        .route(
            "/pub/{token}/{filename}",
            get(crate::http::pub_files::pub_file_handler),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
