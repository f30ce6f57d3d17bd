use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::connector::Connector;
use crate::domain::{
    BusinessDomainId, LinkPartnerName, Message, MessageContent, TransportId, TransportStatusUpdate,
};
use crate::error::ConnectorError;
use crate::queue::MessageQueue;
use crate::routing::RuleExpression;

use super::request::{DefaultBackendRequest, RoutingRuleRequest, ValidateExpressionRequest};
use super::response::{
    ErrorResponse, HealthResponse, ReadyResponse, RoutingRulesResponse, StatusRecordedResponse,
    SubmitMessageResponse, ValidateExpressionResponse,
};

/// Shared application state.
pub struct AppState {
    pub connector: Arc<Connector>,

    /// Application start time
    pub start_time: Instant,

    /// Application version
    pub version: String,
}

/// Create the admin router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/lanes/:tenant/messages", post(handle_submit_message))
        .route(
            "/v1/lanes/:tenant/routing-rules",
            get(handle_list_rules).post(handle_add_rule),
        )
        .route(
            "/v1/lanes/:tenant/routing-rules/:rule_id",
            axum::routing::delete(handle_delete_rule),
        )
        .route("/v1/lanes/:tenant/default-backend", put(handle_set_default_backend))
        .route("/v1/routing/validate", post(handle_validate_expression))
        .route("/v1/links/:link/pending", get(handle_pending_transports))
        .route("/v1/transports/:transport_id", get(handle_get_transport))
        .route("/v1/transports/:transport_id/status", post(handle_transport_status))
        .route("/health", get(handle_health))
        .route("/ready", get(handle_ready))
        .route("/metrics", get(handle_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_reply(err: &ConnectorError) -> Response {
    let (status, body) = ErrorResponse::from_error(err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!(error = %err, "Admin request failed");
    }
    (status, Json(body)).into_response()
}

/// Put a message from a link plugin on the inbound queue.
async fn handle_submit_message(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
    Json(mut message): Json<Message>,
) -> Response {
    let tenant = BusinessDomainId::new(tenant);
    if let Err(e) = state.connector.tenants.get(&tenant) {
        return error_reply(&e);
    }
    if !message.is_business_message() && !message.is_evidence_message() {
        return error_reply(&ConnectorError::illegal_message(
            &message.connector_message_id,
            "neither a business nor an evidence message",
        ));
    }

    message.tenant = tenant;
    let connector_message_id = message.connector_message_id.to_string();
    if let Err(e) = state.connector.queues.to_controller.publish(message).await {
        return error_reply(&e);
    }

    (
        StatusCode::ACCEPTED,
        Json(SubmitMessageResponse { connector_message_id }),
    )
        .into_response()
}

async fn handle_list_rules(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
) -> Response {
    let tenant = BusinessDomainId::new(tenant);
    let routing = &state.connector.routing;

    let rules = match routing.list_rules(&tenant).await {
        Ok(rules) => rules,
        Err(e) => return error_reply(&e),
    };
    let default_backend = match routing.default_destination(&tenant).await {
        Ok(name) => name,
        Err(e) => return error_reply(&e),
    };

    Json(RoutingRulesResponse {
        tenant: tenant.to_string(),
        default_backend,
        rules,
    })
    .into_response()
}

async fn handle_add_rule(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
    Json(req): Json<RoutingRuleRequest>,
) -> Response {
    let tenant = BusinessDomainId::new(tenant);
    if let Err(e) = state.connector.tenants.get(&tenant) {
        return error_reply(&e);
    }
    let rule = match req.to_rule() {
        Ok(rule) => rule,
        Err(e) => return error_reply(&ConnectorError::from(e)),
    };

    let routing = &state.connector.routing;
    if req.persist {
        if let Err(e) = routing.add_rule_persisted(&tenant, rule.clone()).await {
            return error_reply(&e);
        }
    } else {
        routing.add_rule(&tenant, rule.clone());
    }

    (StatusCode::CREATED, Json(rule)).into_response()
}

/// Delete a runtime rule, dynamic or durable.
async fn handle_delete_rule(
    State(state): State<Arc<AppState>>,
    Path((tenant, rule_id)): Path<(String, String)>,
) -> Response {
    let tenant = BusinessDomainId::new(tenant);
    if let Err(e) = state.connector.tenants.get(&tenant) {
        return error_reply(&e);
    }

    let routing = &state.connector.routing;
    let dynamic = routing.delete_rule(&tenant, &rule_id);
    let durable = match routing.delete_rule_persisted(&tenant, &rule_id).await {
        Ok(removed) => removed,
        Err(e) => return error_reply(&e),
    };

    if dynamic || durable {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::not_found(format!("No runtime routing rule [{}]", rule_id))),
        )
            .into_response()
    }
}

async fn handle_set_default_backend(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
    Json(req): Json<DefaultBackendRequest>,
) -> Response {
    if req.link_name.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::bad_request("link_name must not be empty")),
        )
            .into_response();
    }

    let tenant = BusinessDomainId::new(tenant);
    match state
        .connector
        .routing
        .set_default_destination(&tenant, LinkPartnerName::new(req.link_name))
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_reply(&e),
    }
}

/// Parse an expression and, given message details, evaluate it.
async fn handle_validate_expression(Json(req): Json<ValidateExpressionRequest>) -> impl IntoResponse {
    let expr = match RuleExpression::parse(&req.expression) {
        Ok(expr) => expr,
        Err(e) => {
            return Json(ValidateExpressionResponse {
                valid: false,
                expression: None,
                error: Some(e.to_string()),
                matches: None,
            })
        }
    };

    let matches = req.details.map(|details| {
        let message = Message::business(
            BusinessDomainId::default_lane(),
            details,
            MessageContent::new("", Vec::new()),
        );
        expr.evaluate(&message)
    });

    Json(ValidateExpressionResponse {
        valid: true,
        expression: Some(expr.to_string()),
        error: None,
        matches,
    })
}

/// Open transports of a link, for pull-style partners.
async fn handle_pending_transports(
    State(state): State<Arc<AppState>>,
    Path(link): Path<String>,
) -> Response {
    match state
        .connector
        .transports
        .pending_steps_for(&LinkPartnerName::new(link))
        .await
    {
        Ok(steps) => Json(steps).into_response(),
        Err(e) => error_reply(&e),
    }
}

async fn handle_get_transport(
    State(state): State<Arc<AppState>>,
    Path(transport_id): Path<String>,
) -> Response {
    let transport_id = TransportId::new(transport_id);
    match state.connector.transports.get_transport_step(&transport_id).await {
        Ok(Some(step)) => Json(step).into_response(),
        Ok(None) => error_reply(&ConnectorError::TransportStepNotFound(transport_id)),
        Err(e) => error_reply(&e),
    }
}

/// Status report of a link partner for one transport.
async fn handle_transport_status(
    State(state): State<Arc<AppState>>,
    Path(transport_id): Path<String>,
    Json(update): Json<TransportStatusUpdate>,
) -> Response {
    let transport_id = TransportId::new(transport_id);
    let reported = update.state;

    match state.connector.dispatcher.record_status(&transport_id, update).await {
        Ok(retry_transport_id) => {
            info!(transport_id = %transport_id, state = %reported, "Transport status reported");
            Json(StatusRecordedResponse {
                transport_id,
                retry_transport_id,
            })
            .into_response()
        }
        Err(e) => error_reply(&e),
    }
}

/// Health check endpoint.
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: state.version.clone(),
        config_version: state.connector.tenants.config().version.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// Ready once at least one business domain is enabled.
async fn handle_ready(State(state): State<Arc<AppState>>) -> Response {
    let config = state.connector.tenants.config();
    let tenants = state.connector.tenants.tenant_ids().len();

    if tenants == 0 {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new("No business domain enabled", "NOT_READY")),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        Json(ReadyResponse {
            ready: true,
            config_version: config.version.clone(),
            tenants,
            link_partners: state.connector.links.names(),
        }),
    )
        .into_response()
}

/// Metrics endpoint (Prometheus format).
async fn handle_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metrics = format!(
        r#"# HELP lanebridge_uptime_seconds Application uptime in seconds
# TYPE lanebridge_uptime_seconds counter
lanebridge_uptime_seconds {}

{}"#,
        state.start_time.elapsed().as_secs(),
        state.connector.metrics.to_prometheus(),
    );

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; charset=utf-8",
        )],
        metrics,
    )
}
