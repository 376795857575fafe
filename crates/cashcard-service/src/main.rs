use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::header::LOCATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cashcard_api::{
    parse_sort, CashCardApi, CreateCardRequest, UpdateCardRequest, API_CONTRACT_VERSION,
};
use cashcard_core::{Card, CardId, Identity, LedgerError, PageSpec, Role, SortSpec};
use clap::Parser;
use serde::{Deserialize, Serialize};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

/// Trusted identity headers, populated by the authenticating reverse proxy.
const IDENTITY_NAME_HEADER: &str = "x-identity-name";
const IDENTITY_ROLES_HEADER: &str = "x-identity-roles";

#[derive(Debug, Clone)]
struct ServiceState {
    api: CashCardApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ListParams {
    page: Option<u32>,
    size: Option<u32>,
    sort: Option<String>,
}

#[derive(Debug, Parser)]
#[command(name = "cashcard-service")]
#[command(about = "Local HTTP service for the CashCard ledger")]
struct Args {
    #[arg(long, default_value = "./cashcard.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

fn service_error(status: StatusCode, message: impl Into<String>) -> ServiceError {
    ServiceError {
        status,
        service_contract_version: SERVICE_CONTRACT_VERSION,
        error: message.into(),
    }
}

/// Collapse an API error onto the outward status map. `NotFound` covers
/// absent, inactive, and foreign-owned records without distinction.
fn ledger_error_response(err: &anyhow::Error) -> ServiceError {
    let status = match err.downcast_ref::<LedgerError>() {
        Some(LedgerError::NotFound) => StatusCode::NOT_FOUND,
        Some(LedgerError::AuthorizationDenied) => StatusCode::FORBIDDEN,
        Some(LedgerError::Validation(_)) => StatusCode::BAD_REQUEST,
        Some(LedgerError::Conflict(_)) => StatusCode::CONFLICT,
        Some(LedgerError::Storage(_)) | None => StatusCode::INTERNAL_SERVER_ERROR,
    };
    service_error(status, err.to_string())
}

fn identity_from_headers(headers: &HeaderMap) -> Result<Identity, ServiceError> {
    let name = headers
        .get(IDENTITY_NAME_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| service_error(StatusCode::UNAUTHORIZED, "missing caller identity"))?;

    let roles_raw = headers
        .get(IDENTITY_ROLES_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    let mut roles = Vec::new();
    for tag in roles_raw.split(',').map(str::trim).filter(|tag| !tag.is_empty()) {
        let role = Role::parse(tag).ok_or_else(|| {
            service_error(StatusCode::BAD_REQUEST, format!("unknown role: {tag}"))
        })?;
        roles.push(role);
    }

    Ok(Identity::new(name, roles))
}

fn parse_card_id(raw: &str) -> Result<CardId, ServiceError> {
    CardId::parse(raw)
        .ok_or_else(|| service_error(StatusCode::NOT_FOUND, format!("not found: {raw}")))
}

fn list_query(params: &ListParams) -> Result<(PageSpec, SortSpec), ServiceError> {
    let defaults = PageSpec::default();
    let page = PageSpec {
        page: params.page.unwrap_or(defaults.page),
        size: params.size.unwrap_or(defaults.size),
    };
    let sort = match &params.sort {
        Some(raw) => parse_sort(raw).ok_or_else(|| {
            service_error(StatusCode::BAD_REQUEST, format!("invalid sort expression: {raw}"))
        })?,
        None => SortSpec::default(),
    };
    Ok((page, sort))
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", get(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/cashcards", get(cards_list).post(cards_create))
        .route(
            "/v1/cashcards/:card_id",
            get(cards_get).put(cards_update).delete(cards_deactivate),
        )
        .route("/v1/audit/card/:card_id", get(audit_show))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let state = ServiceState { api: CashCardApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<cashcard_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = state
        .api
        .schema_status()
        .map_err(|err| service_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<cashcard_api::MigrateResult>>, ServiceError> {
    let result = state
        .api
        .migrate(request.dry_run)
        .map_err(|err| service_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn cards_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<ServiceEnvelope<Vec<Card>>>, ServiceError> {
    let identity = identity_from_headers(&headers)?;
    let (page, sort) = list_query(&params)?;
    let cards = state
        .api
        .list_cards(&identity, &page, &sort)
        .map_err(|err| ledger_error_response(&err))?;
    Ok(Json(envelope(cards)))
}

async fn cards_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<CreateCardRequest>,
) -> Result<Response, ServiceError> {
    let identity = identity_from_headers(&headers)?;
    let card = state
        .api
        .create_card(&identity, request)
        .map_err(|err| ledger_error_response(&err))?;

    let location = format!("/v1/cashcards/{}", card.id);
    Ok((
        StatusCode::CREATED,
        [(LOCATION, location)],
        Json(envelope(card)),
    )
        .into_response())
}

async fn cards_get(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(card_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Card>>, ServiceError> {
    let identity = identity_from_headers(&headers)?;
    let id = parse_card_id(&card_id)?;
    let card = state.api.get_card(&identity, id).map_err(|err| ledger_error_response(&err))?;
    Ok(Json(envelope(card)))
}

async fn cards_update(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(card_id): Path<String>,
    Json(request): Json<UpdateCardRequest>,
) -> Result<StatusCode, ServiceError> {
    let identity = identity_from_headers(&headers)?;
    let id = parse_card_id(&card_id)?;
    state
        .api
        .update_card(&identity, id, request)
        .map_err(|err| ledger_error_response(&err))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cards_deactivate(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(card_id): Path<String>,
) -> Result<StatusCode, ServiceError> {
    let identity = identity_from_headers(&headers)?;
    let id = parse_card_id(&card_id)?;
    state
        .api
        .deactivate_card(&identity, id)
        .map_err(|err| ledger_error_response(&err))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn audit_show(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(card_id): Path<String>,
) -> Result<Json<ServiceEnvelope<cashcard_core::AuditEntry>>, ServiceError> {
    let identity = identity_from_headers(&headers)?;
    let id = parse_card_id(&card_id)?;
    let entry = state
        .api
        .audit_entry(&identity, id)
        .map_err(|err| ledger_error_response(&err))?;
    Ok(Json(envelope(entry)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("cashcard-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn router_with_db(db_path: PathBuf) -> Router {
        app(ServiceState { api: CashCardApi::new(db_path) })
    }

    fn request(
        method: &str,
        uri: &str,
        identity: Option<(&str, &str)>,
        body: Option<serde_json::Value>,
    ) -> Request<Body> {
        let mut builder = Request::builder().uri(uri).method(method);
        if let Some((name, roles)) = identity {
            builder = builder
                .header(IDENTITY_NAME_HEADER, name)
                .header(IDENTITY_ROLES_HEADER, roles);
        }
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        builder.body(body).unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn send(router: Router, req: Request<Body>) -> Response {
        match router.oneshot(req).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn create_card(router: Router, name: &str, amount: f64) -> String {
        let response = send(
            router,
            request(
                "POST",
                "/v1/cashcards",
                Some((name, "card-owner")),
                Some(serde_json::json!({ "amount": amount })),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_else(|| panic!("missing Location header"))
            .to_string();
        location
            .rsplit('/')
            .next()
            .unwrap_or_else(|| panic!("malformed Location header: {location}"))
            .to_string()
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = router_with_db(unique_temp_db_path());
        let response = send(router, request("GET", "/v1/health", None, None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let router = router_with_db(unique_temp_db_path());
        let response = send(router, request("GET", "/v1/openapi", None, None)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/cashcards"));
        assert!(body.contains("/v1/audit/card/{cardId}"));
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn missing_identity_is_unauthorized_before_any_policy() {
        let db_path = unique_temp_db_path();
        let router = router_with_db(db_path.clone());

        let response =
            send(router.clone(), request("GET", "/v1/cashcards", None, None)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = send(
            router,
            request(
                "POST",
                "/v1/cashcards",
                None,
                Some(serde_json::json!({ "amount": 1.0 })),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn unknown_role_tag_is_a_bad_request() {
        let db_path = unique_temp_db_path();
        let router = router_with_db(db_path.clone());

        let response = send(
            router,
            request("GET", "/v1/cashcards", Some(("sarah", "superuser")), None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn create_returns_created_with_location_and_get_round_trips() {
        let db_path = unique_temp_db_path();
        let router = router_with_db(db_path.clone());

        let card_id = create_card(router.clone(), "sarah", 250.00).await;

        let response = send(
            router,
            request(
                "GET",
                &format!("/v1/cashcards/{card_id}"),
                Some(("sarah", "card-owner")),
                None,
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        let data = value.get("data").unwrap_or(&serde_json::Value::Null);
        assert_eq!(data.get("owner").and_then(serde_json::Value::as_str), Some("sarah"));
        assert_eq!(data.get("amount").and_then(serde_json::Value::as_f64), Some(250.00));
        assert_eq!(data.get("active").and_then(serde_json::Value::as_bool), Some(true));

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn create_ignores_caller_supplied_identity_fields() {
        let db_path = unique_temp_db_path();
        let router = router_with_db(db_path.clone());

        let response = send(
            router.clone(),
            request(
                "POST",
                "/v1/cashcards",
                Some(("sarah", "card-owner")),
                Some(serde_json::json!({
                    "amount": 10.0,
                    "id": "01ARZ3NDEKTSV4RRFFQ69G5FAV",
                    "owner": "kumar",
                    "active": false
                })),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let value = response_json(response).await;
        let data = value.get("data").unwrap_or(&serde_json::Value::Null);
        assert_eq!(data.get("owner").and_then(serde_json::Value::as_str), Some("sarah"));
        assert_eq!(data.get("active").and_then(serde_json::Value::as_bool), Some(true));
        assert_ne!(
            data.get("id").and_then(serde_json::Value::as_str),
            Some("01ARZ3NDEKTSV4RRFFQ69G5FAV")
        );

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-007
    #[tokio::test]
    async fn foreign_owner_and_absent_id_are_both_not_found() {
        let db_path = unique_temp_db_path();
        let router = router_with_db(db_path.clone());

        let card_id = create_card(router.clone(), "sarah", 250.00).await;

        let foreign = send(
            router.clone(),
            request(
                "GET",
                &format!("/v1/cashcards/{card_id}"),
                Some(("kumar", "card-owner")),
                None,
            ),
        )
        .await;
        assert_eq!(foreign.status(), StatusCode::NOT_FOUND);

        let absent = send(
            router,
            request(
                "GET",
                &format!("/v1/cashcards/{}", CardId::new()),
                Some(("kumar", "card-owner")),
                None,
            ),
        )
        .await;
        assert_eq!(absent.status(), StatusCode::NOT_FOUND);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-008
    #[tokio::test]
    async fn missing_role_is_forbidden() {
        let db_path = unique_temp_db_path();
        let router = router_with_db(db_path.clone());

        let response = send(
            router.clone(),
            request("GET", "/v1/cashcards", Some(("hank-owns-no-cards", "")), None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // Admin role grants audit access, not card access.
        let response = send(
            router,
            request("GET", "/v1/cashcards", Some(("admin", "admin")), None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-009
    #[tokio::test]
    async fn update_returns_no_content_and_persists_the_amount() {
        let db_path = unique_temp_db_path();
        let router = router_with_db(db_path.clone());

        let card_id = create_card(router.clone(), "sarah", 123.45).await;

        let response = send(
            router.clone(),
            request(
                "PUT",
                &format!("/v1/cashcards/{card_id}"),
                Some(("sarah", "card-owner")),
                Some(serde_json::json!({ "amount": 19.99 })),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = send(
            router,
            request(
                "GET",
                &format!("/v1/cashcards/{card_id}"),
                Some(("sarah", "card-owner")),
                None,
            ),
        )
        .await;
        let value = response_json(response).await;
        assert_eq!(
            value.get("data").and_then(|data| data.get("amount")).and_then(serde_json::Value::as_f64),
            Some(19.99)
        );

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-010
    #[tokio::test]
    async fn missing_amount_is_a_bad_request() {
        let db_path = unique_temp_db_path();
        let router = router_with_db(db_path.clone());

        let response = send(
            router,
            request(
                "POST",
                "/v1/cashcards",
                Some(("sarah", "card-owner")),
                Some(serde_json::json!({})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-011
    #[tokio::test]
    async fn deactivate_hides_the_card_and_exposes_the_audit_entry_to_admins() {
        let db_path = unique_temp_db_path();
        let router = router_with_db(db_path.clone());

        let card_id = create_card(router.clone(), "sarah", 250.00).await;

        let response = send(
            router.clone(),
            request(
                "DELETE",
                &format!("/v1/cashcards/{card_id}"),
                Some(("sarah", "card-owner")),
                None,
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let gone = send(
            router.clone(),
            request(
                "GET",
                &format!("/v1/cashcards/{card_id}"),
                Some(("sarah", "card-owner")),
                None,
            ),
        )
        .await;
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);

        let again = send(
            router.clone(),
            request(
                "DELETE",
                &format!("/v1/cashcards/{card_id}"),
                Some(("sarah", "card-owner")),
                None,
            ),
        )
        .await;
        assert_eq!(again.status(), StatusCode::NOT_FOUND);

        // The owner role cannot read the audit trail.
        let denied = send(
            router.clone(),
            request(
                "GET",
                &format!("/v1/audit/card/{card_id}"),
                Some(("sarah", "card-owner")),
                None,
            ),
        )
        .await;
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let entry = send(
            router,
            request(
                "GET",
                &format!("/v1/audit/card/{card_id}"),
                Some(("admin", "admin")),
                None,
            ),
        )
        .await;
        assert_eq!(entry.status(), StatusCode::OK);
        let value = response_json(entry).await;
        let data = value.get("data").unwrap_or(&serde_json::Value::Null);
        assert_eq!(data.get("subject_type").and_then(serde_json::Value::as_str), Some("Card"));
        assert_eq!(
            data.get("subject_id").and_then(serde_json::Value::as_str),
            Some(card_id.as_str())
        );

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-012
    #[tokio::test]
    async fn list_returns_owned_cards_sorted_and_paged() {
        let db_path = unique_temp_db_path();
        let router = router_with_db(db_path.clone());

        for amount in [123.45, 1.00, 150.00] {
            let _ = create_card(router.clone(), "sarah", amount).await;
        }
        let _ = create_card(router.clone(), "kumar", 999.0).await;

        let response = send(
            router.clone(),
            request("GET", "/v1/cashcards", Some(("sarah", "card-owner")), None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        let amounts = value
            .get("data")
            .and_then(serde_json::Value::as_array)
            .map(|cards| {
                cards
                    .iter()
                    .filter_map(|card| card.get("amount").and_then(serde_json::Value::as_f64))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        assert_eq!(amounts, vec![1.00, 123.45, 150.00]);

        let response = send(
            router,
            request(
                "GET",
                "/v1/cashcards?page=0&size=1&sort=amount,desc",
                Some(("sarah", "card-owner")),
                None,
            ),
        )
        .await;
        let value = response_json(response).await;
        let amounts = value
            .get("data")
            .and_then(serde_json::Value::as_array)
            .map(|cards| {
                cards
                    .iter()
                    .filter_map(|card| card.get("amount").and_then(serde_json::Value::as_f64))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        assert_eq!(amounts, vec![150.00]);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-013
    #[tokio::test]
    async fn malformed_card_id_is_not_found() {
        let db_path = unique_temp_db_path();
        let router = router_with_db(db_path.clone());

        let response = send(
            router,
            request(
                "GET",
                "/v1/cashcards/not-a-ulid",
                Some(("sarah", "card-owner")),
                None,
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let _ = std::fs::remove_file(&db_path);
    }
}
