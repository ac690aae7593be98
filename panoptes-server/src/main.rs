use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

use panoptes_core::RepoRef;
use panoptes_server::backends::{AnthropicBackend, GeminiBackend, OpenAiBackend};
use panoptes_server::config::Config;
use panoptes_server::db::SqliteDb;
use panoptes_server::dispatch::{BackendPool, Dispatcher, ModelClassifier};
use panoptes_server::duplicate::DuplicateDetector;
use panoptes_server::github::GithubClient;
use panoptes_server::orchestrator::{
    ReviewOptions, ReviewOrchestrator, WorkflowSettings,
};
use panoptes_server::poster::{CategoryTierFilter, Poster};
use panoptes_server::validation::ValidationPipeline;
use panoptes_server::{
    ApprovalOutcome, FeatureFlag, ModelBackend, Notifier, NullNotifier, SlackNotifier,
};

struct AppState {
    orchestrator: ReviewOrchestrator,
    poster: Poster,
    company_id: u64,
    auth_token: Option<String>,
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "panoptes"
    }))
}

async fn help_handler() -> Json<Value> {
    Json(json!({
        "service": "panoptes",
        "version": panoptes_server::get_bot_version(),
        "description": "Multi-model pull request review orchestration",
        "endpoints": [
            {
                "path": "/health",
                "method": "GET",
                "description": "Health check endpoint",
                "authentication": "None"
            },
            {
                "path": "/reviews/{owner}/{repo}/{pr}",
                "method": "POST",
                "description": "Run a review of the given pull request",
                "authentication": "Bearer token (REVIEW_AUTH_TOKEN)"
            },
            {
                "path": "/help",
                "method": "GET",
                "description": "API documentation and service information",
                "authentication": "None"
            }
        ],
        "configuration": {
            "required_env_vars": ["GITHUB_TOKEN", "ANTHROPIC_API_KEY"],
            "optional_env_vars": [
                "OPENAI_API_KEY", "GEMINI_API_KEY",
                "ANTHROPIC_MODEL", "OPENAI_MODEL", "GEMINI_MODEL",
                "STRICT_VALIDATION_MODEL",
                "SLACK_WEBHOOK_URL", "COMPANY_ID", "BOT_LOGIN",
                "AUTOMATIC_APPROVAL (default: false)",
                "COMMITTABLE_SUGGESTIONS (default: true)",
                "ACTIVE_PERSONAS", "MAX_POSTED_COMMENTS (default: 10)",
                "PORT (default: 3000)", "STATE_DIR (default: current directory)",
                "REVIEW_AUTH_TOKEN"
            ]
        }
    }))
}

#[derive(Debug, Deserialize)]
struct ReviewParams {
    #[serde(default)]
    skip_if_approved: bool,
    #[serde(default = "default_true")]
    dedupe_existing: bool,
    /// When false, run the review but do not post or approve anything.
    #[serde(default = "default_true")]
    post: bool,
}

fn default_true() -> bool {
    true
}

fn authorized(headers: &HeaderMap, auth_token: &Option<String>) -> bool {
    let Some(expected) = auth_token else {
        return false;
    };
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected)
}

fn approval_json(approval: &ApprovalOutcome) -> Value {
    match approval {
        ApprovalOutcome::NotEvaluated => json!({ "evaluated": false }),
        ApprovalOutcome::Approved { reason } => {
            json!({ "evaluated": true, "approved": true, "reason": reason })
        }
        ApprovalOutcome::Declined { reason } => {
            json!({ "evaluated": true, "approved": false, "reason": reason })
        }
        ApprovalOutcome::Failed { error } => {
            json!({ "evaluated": true, "approved": false, "error": error })
        }
    }
}

async fn review_handler(
    State(state): State<Arc<AppState>>,
    Path((owner, repo, pr_number)): Path<(String, String, u64)>,
    Query(params): Query<ReviewParams>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers, &state.auth_token) {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    let request_id = uuid::Uuid::new_v4().to_string();
    let repo = RepoRef::new(owner, repo);
    info!(%request_id, repo = %repo, pr_number, "review requested");
    let opts = ReviewOptions {
        skip_if_approved: params.skip_if_approved,
        dedupe_existing: params.dedupe_existing,
    };

    let outcome = match state
        .orchestrator
        .review_pull_request(&repo, pr_number, None, opts)
        .await
    {
        Ok(outcome) => outcome,
        Err(failure) => {
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "error": failure.to_string(),
                    "files": failure.files.iter().map(|f| &f.filename).collect::<Vec<_>>(),
                })),
            )
                .into_response();
        }
    };

    if !params.post {
        return Json(json!({
            "request_id": request_id,
            "comments": outcome.comments,
            "files": outcome.files.iter().map(|f| &f.filename).collect::<Vec<_>>(),
        }))
        .into_response();
    }

    let posted = state
        .poster
        .post_review_comments(&repo, pr_number, state.company_id, outcome.comments)
        .await;

    Json(json!({
        "request_id": request_id,
        "posted": posted.posted,
        "filtered": posted.filtered,
        "approval": approval_json(&posted.approval),
        "files": outcome.files.iter().map(|f| &f.filename).collect::<Vec<_>>(),
    }))
    .into_response()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting panoptes review service");

    let config = Config::from_env().expect("failed to load configuration from environment");

    let db_path = config.state_dir.join("panoptes.db");
    info!("Using state database: {}", db_path.display());
    let db = Arc::new(SqliteDb::new(&db_path).expect("failed to initialize SQLite database"));

    let vcs = Arc::new(GithubClient::new(config.github_token.clone()));

    let notifier: Arc<dyn Notifier> = match &config.slack_webhook_url {
        Some(url) => Arc::new(SlackNotifier::new(url.clone())),
        None => Arc::new(NullNotifier),
    };

    let primary: Arc<dyn ModelBackend> = Arc::new(AnthropicBackend::new(
        config.anthropic_api_key.clone(),
        config.anthropic_model.clone(),
    ));
    let mut secondaries: Vec<(FeatureFlag, Arc<dyn ModelBackend>)> = Vec::new();
    if let Some(key) = &config.openai_api_key {
        secondaries.push((
            FeatureFlag::AddOpenAiResults,
            Arc::new(OpenAiBackend::new(key.clone(), config.openai_model.clone())),
        ));
    }
    if let Some(key) = &config.gemini_api_key {
        secondaries.push((
            FeatureFlag::AddGeminiResults,
            Arc::new(GeminiBackend::new(key.clone(), config.gemini_model.clone())),
        ));
    }
    let secondary_backend = secondaries.first().map(|(_, backend)| backend.clone());

    let dispatcher = Dispatcher::new(
        BackendPool {
            primary: primary.clone(),
            secondaries,
        },
        Arc::new(ModelClassifier::new(primary.clone())),
        notifier.clone(),
    );
    let validation = ValidationPipeline {
        primary: primary.clone(),
        secondary: secondary_backend,
        strict_model: config.strict_validation_model.clone(),
    };
    let duplicates = DuplicateDetector::new(primary.clone());

    let orchestrator = ReviewOrchestrator::new(
        vcs.clone(),
        dispatcher,
        validation,
        duplicates,
        db.clone(),
        WorkflowSettings {
            company_id: config.company_id,
            bot_login: config.bot_login.clone(),
            active_personas: config.active_personas.clone(),
            committable_suggestions: config.committable_suggestions,
        },
    );

    let poster = Poster::new(
        vcs,
        db,
        notifier,
        primary,
        Arc::new(CategoryTierFilter {
            max_comments: config.max_posted_comments,
        }),
        config.automatic_approval,
    );

    let app_state = Arc::new(AppState {
        orchestrator,
        poster,
        company_id: config.company_id,
        auth_token: config.review_auth_token.clone(),
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/help", get(help_handler))
        .route("/reviews/{owner}/{repo}/{pr}", post(review_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
