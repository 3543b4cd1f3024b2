//! Router construction

use crate::{handlers, middleware::metrics::track_requests, state::AppState};
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use tower::{limit::ConcurrencyLimitLayer, ServiceBuilder};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Source documents
        .route("/documents/parse", post(handlers::documents::parse_document))
        .route("/documents/{id}/make-current", post(handlers::documents::make_current))
        // Deliverable sections
        .route("/sections/{id}/generate", post(handlers::sections::generate_section))
        .route("/sections/{id}/content", put(handlers::sections::update_content))
        .route("/sections/{id}/lock", post(handlers::sections::lock_section))
        .route("/sections/{id}/unlock", post(handlers::sections::unlock_section))
        .route("/sections/{id}/status", put(handlers::sections::set_status))
        .route("/sections/{id}/history", get(handlers::sections::section_history))
        // Projects
        .route(
            "/projects/{id}/sections/{custom_section_id}/draft",
            post(handlers::sections::draft_section),
        )
        .route("/projects/{id}/globals/extract", post(handlers::projects::extract_globals))
        .route("/projects/{id}/globals", get(handlers::projects::list_globals))
        // Templates
        .route("/templates", get(handlers::templates::list_templates))
        .route("/templates/ideal/{id}/structure", get(handlers::templates::template_structure))
        .route("/templates/ideal/{id}/embed", post(handlers::templates::embed_template))
        // Deliverables
        .route("/deliverables", post(handlers::deliverables::create_deliverable))
        .route("/deliverables/{id}/export", get(handlers::deliverables::export_deliverable))
        // Administration
        .route("/prompts/reload", post(handlers::prompts::reload_prompts))
        .route_layer(middleware::from_fn(track_requests));

    let request_timeout = state.config.request_timeout();
    let max_concurrent = state.config.server.max_concurrent_requests.max(1);

    // Compose the app
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .nest("/v1", api_routes)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(cors)
                .layer(CompressionLayer::new())
                .layer(TimeoutLayer::new(request_timeout))
                .layer(ConcurrencyLimitLayer::new(max_concurrent)),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request, StatusCode},
    };
    use clinforge_common::{
        config::AppConfig,
        db::{models::*, schema, DbPool, Repository},
        embeddings::{Embedder, MockEmbedder},
        errors::Result,
        generation::DocumentRenderer,
        llm::{LlmClient, MockLlmClient},
        prompts::PromptStore,
    };
    use clinforge_ingestion::DocumentProcessor;
    use sea_orm::Database;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    struct FixedRenderer;

    #[async_trait]
    impl DocumentRenderer for FixedRenderer {
        async fn render_docx(&self, _html: &str) -> Result<Vec<u8>> {
            Ok(b"PK\x03\x04docx".to_vec())
        }
    }

    struct Fixture {
        app: Router,
        repo: Repository,
        project: Project,
        ideal_template: IdealTemplate,
        custom_template: CustomTemplate,
        custom_section: CustomSection,
    }

    async fn fixture() -> Fixture {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        schema::create_schema(&db).await.unwrap();
        let repo = Repository::new(DbPool::from_connection(db));

        let config = Arc::new(AppConfig::default());
        let embedder: Arc<dyn Embedder> = Arc::new(MockEmbedder::new(8));
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::replying("{}"));
        let prompts = Arc::new(
            PromptStore::load(concat!(env!("CARGO_MANIFEST_DIR"), "/../../prompts.yaml")).unwrap(),
        );
        let processor =
            DocumentProcessor::from_config(&config, repo.clone(), embedder.clone(), llm.clone(), prompts.clone())
                .unwrap();

        let project = repo.create_project("Study ABC").await.unwrap();
        let ideal_template = repo.create_ideal_template("CSR", "1.0").await.unwrap();
        let ideal_section = repo
            .create_ideal_section(ideal_template.id, None, "Synopsis", 0)
            .await
            .unwrap();
        let custom_template = repo
            .create_custom_template(Some(project.id), Some(ideal_template.id), "Study ABC CSR")
            .await
            .unwrap();
        let custom_section = repo
            .create_custom_section(custom_template.id, Some(ideal_section.id), None, "Synopsis", 0)
            .await
            .unwrap();

        let state = AppState::new(
            config,
            repo.clone(),
            embedder,
            llm,
            prompts,
            processor,
            Arc::new(FixedRenderer),
        );

        Fixture {
            app: create_router(state),
            repo,
            project,
            ideal_template,
            custom_template,
            custom_section,
        }
    }

    impl Fixture {
        async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
            let builder = Request::builder().method(method).uri(uri);
            let request = match body {
                Some(body) => builder
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };

            let response = self.app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            (status, bytes.to_vec())
        }

        async fn json(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            let (status, bytes) = self.call(method, uri, body).await;
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, value)
        }

        async fn section(&self) -> DeliverableSection {
            let (_, sections) = self
                .repo
                .create_deliverable(self.project.id, self.custom_template.id, "Clinical Study Report")
                .await
                .unwrap();
            sections.into_iter().next().unwrap()
        }
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let fx = fixture().await;
        tokio_test::assert_ok!(fx.repo.ping().await);

        let (status, body) = fx.json(Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let (status, body) = fx.json(Method::GET, "/ready", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["database"]["status"], "up");
        assert_eq!(body["checks"]["queue"]["status"], "disabled");
    }

    #[tokio::test]
    async fn test_parse_requires_exactly_one_locator() {
        let fx = fixture().await;

        let (status, body) = fx
            .json(
                Method::POST,
                "/v1/documents/parse",
                Some(json!({ "document_id": Uuid::new_v4() })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        let (status, _) = fx
            .json(
                Method::POST,
                "/v1/documents/parse",
                Some(json!({
                    "document_id": Uuid::new_v4(),
                    "file_url": "https://example.org/a.pdf",
                    "file_path": "p/a.pdf"
                })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_queued_parse_without_queue_is_unavailable() {
        let fx = fixture().await;
        let (status, body) = fx
            .json(
                Method::POST,
                "/v1/documents/parse",
                Some(json!({
                    "document_id": Uuid::new_v4(),
                    "file_path": "study/protocol.pdf",
                    "mode": "queued"
                })),
            )
            .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_lock_gate_blocks_other_users() {
        let fx = fixture().await;
        let section = fx.section().await;
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        let (status, body) = fx
            .json(
                Method::POST,
                &format!("/v1/sections/{}/lock", section.id),
                Some(json!({ "user_id": alice })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["locked_by_user_id"], json!(alice));

        let (status, body) = fx
            .json(
                Method::POST,
                &format!("/v1/sections/{}/generate", section.id),
                Some(json!({ "user_id": bob })),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "SECTION_LOCKED");

        let (status, _) = fx
            .json(
                Method::PUT,
                &format!("/v1/sections/{}/content", section.id),
                Some(json!({ "user_id": bob, "content_html": "<p>x</p>" })),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = fx
            .json(
                Method::POST,
                &format!("/v1/sections/{}/unlock", section.id),
                Some(json!({ "user_id": bob })),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = fx
            .json(
                Method::POST,
                &format!("/v1/sections/{}/unlock", section.id),
                Some(json!({ "user_id": alice })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["locked_by_user_id"].is_null());
    }

    #[tokio::test]
    async fn test_generate_without_rules_stores_placeholder() {
        let fx = fixture().await;
        let section = fx.section().await;
        let user = Uuid::new_v4();

        let (status, body) = fx
            .json(
                Method::POST,
                &format!("/v1/sections/{}/generate", section.id),
                Some(json!({ "user_id": user })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["content"]
            .as_str()
            .unwrap()
            .contains("Section requires manual input."));

        let (_, history) = fx
            .json(Method::GET, &format!("/v1/sections/{}/history", section.id), None)
            .await;
        let history = history.as_array().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["change_reason"], "Placeholder: no mapping rules");
        assert_eq!(history[0]["changed_by_user_id"], json!(user));

        let stored = fx.repo.find_deliverable_section(section.id).await.unwrap().unwrap();
        assert_eq!(stored.status, "empty");
    }

    #[tokio::test]
    async fn test_manual_edit_and_status() {
        let fx = fixture().await;
        let section = fx.section().await;

        let (status, body) = fx
            .json(
                Method::PUT,
                &format!("/v1/sections/{}/content", section.id),
                Some(json!({ "user_id": Uuid::new_v4(), "content_html": "<p>Edited</p>" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "in_progress");
        assert_eq!(body["content_html"], "<p>Edited</p>");

        let (status, body) = fx
            .json(
                Method::PUT,
                &format!("/v1/sections/{}/status", section.id),
                Some(json!({ "status": "finished" })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["details"]["field"], "status");

        let (status, body) = fx
            .json(
                Method::PUT,
                &format!("/v1/sections/{}/status", section.id),
                Some(json!({ "status": "review" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "review");
    }

    #[tokio::test]
    async fn test_unknown_section_is_not_found() {
        let fx = fixture().await;
        let (status, body) = fx
            .json(Method::GET, &format!("/v1/sections/{}/history", Uuid::new_v4()), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_create_and_export_deliverable() {
        let fx = fixture().await;

        let (status, body) = fx
            .json(
                Method::POST,
                "/v1/deliverables",
                Some(json!({
                    "project_id": fx.project.id,
                    "custom_template_id": fx.custom_template.id,
                    "title": "Clinical Study Report"
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["deliverable"]["status"], "draft");
        let sections = body["sections"].as_array().unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0]["custom_section_id"], json!(fx.custom_section.id));
        let deliverable_id = body["deliverable"]["id"].as_str().unwrap().to_string();
        let section_id = sections[0]["id"].as_str().unwrap().to_string();

        // Nothing to export yet
        let (status, _) = fx
            .json(Method::GET, &format!("/v1/deliverables/{}/export", deliverable_id), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        fx.json(
            Method::PUT,
            &format!("/v1/sections/{}/content", section_id),
            Some(json!({ "user_id": Uuid::new_v4(), "content_html": "<p>Synopsis</p>" })),
        )
        .await;

        let request = Request::builder()
            .uri(format!("/v1/deliverables/{}/export", deliverable_id))
            .body(Body::empty())
            .unwrap();
        let response = fx.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"Clinical_Study_Report.docx\""
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.starts_with(b"PK"));
    }

    #[tokio::test]
    async fn test_create_deliverable_validates_title() {
        let fx = fixture().await;
        let (status, _) = fx
            .json(
                Method::POST,
                "/v1/deliverables",
                Some(json!({
                    "project_id": fx.project.id,
                    "custom_template_id": fx.custom_template.id,
                    "title": ""
                })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_templates() {
        let fx = fixture().await;

        let (status, body) = fx
            .json(Method::GET, &format!("/v1/templates?project_id={}", fx.project.id), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ideal"].as_array().unwrap().len(), 1);
        assert_eq!(body["custom"][0]["name"], "Study ABC CSR");

        let (status, body) = fx
            .json(
                Method::POST,
                &format!("/v1/templates/ideal/{}/embed", fx.ideal_template.id),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["embedded"], 1);

        let (status, body) = fx
            .json(
                Method::GET,
                &format!("/v1/templates/ideal/{}/structure", fx.ideal_template.id),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["title"], "Synopsis");
        assert_eq!(body[0]["has_embedding"], true);
    }

    #[tokio::test]
    async fn test_globals_for_project() {
        let fx = fixture().await;

        let (status, body) = fx
            .json(Method::GET, &format!("/v1/projects/{}/globals", fx.project.id), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        // No current sections: nothing to extract, nothing stored
        let (status, body) = fx
            .json(
                Method::POST,
                &format!("/v1/projects/{}/globals/extract", fx.project.id),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["facts"], json!({}));

        let (status, _) = fx
            .json(Method::GET, &format!("/v1/projects/{}/globals", Uuid::new_v4()), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reload_prompts() {
        let fx = fixture().await;
        let (status, body) = fx.json(Method::POST, "/v1/prompts/reload", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "reloaded");
        assert_eq!(body["version"], "1");
    }
}
