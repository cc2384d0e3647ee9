//! Axum JSON API for donor statistics: reporting reads, the push API, daily
//! stat upserts and spreadsheet uploads.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{
        multipart::{Multipart, MultipartRejection},
        DefaultBodyLimit, Path, Query, State,
    },
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use chrono::{Local, NaiveDate};
use donorstats_core::{
    parse_calendar_date, DailyDonorStat, ProductTotal, RegionTotal, StoredAgreement,
    ROLLING_WINDOW_DAYS,
};
use donorstats_import::{ImportConfig, ImportSummary, Importer, SheetFormat};
use donorstats_storage::{
    day_summary, new_donors_on, product_breakdown, region_breakdown, upsert_agreement,
    PgRecordStore, RecordStore, UpsertOutcome,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub mod auth;
pub mod config;
pub mod error;
pub mod push;

pub use auth::ApiToken;
pub use config::ServiceConfig;
pub use error::ApiError;
pub use push::{parse_push, PushError};

pub const CRATE_NAME: &str = "donorstats-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub api_token: ApiToken,
    pub import_config: ImportConfig,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(store: Arc<dyn RecordStore>, api_token: ApiToken) -> Self {
        Self {
            store,
            api_token,
            import_config: ImportConfig::default(),
            max_upload_bytes: config::DEFAULT_MAX_UPLOAD_BYTES,
        }
    }

    pub fn from_config(store: Arc<dyn RecordStore>, config: &ServiceConfig) -> Self {
        Self {
            store,
            api_token: config.api_token.clone(),
            import_config: config.import.clone(),
            max_upload_bytes: config.max_upload_bytes,
        }
    }
}

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    let authenticated = Router::new()
        .route("/api/recurring-donors", post(push_donor_handler))
        .route("/api/stats", post(upsert_stat_handler))
        .route(
            "/api/import",
            post(import_handler).layer(DefaultBodyLimit::max(state.max_upload_bytes)),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_bearer));

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/today", get(today_handler))
        .route("/api/stats/{date}", get(stat_for_date_handler))
        .route("/api/recurring-donors/new", get(new_donors_handler))
        .route("/api/recurring-donors/regions", get(regions_handler))
        .route("/api/recurring-donors/products", get(products_handler))
        .merge(authenticated)
        .with_state(state)
}

pub async fn serve(config: ServiceConfig, store: Arc<dyn RecordStore>) -> anyhow::Result<()> {
    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        %addr,
        token = ?config.api_token.fingerprint(),
        "serving donor statistics API"
    );
    axum::serve(listener, app(AppState::from_config(store, &config))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env();
    let store = PgRecordStore::connect(&config.database_url)
        .await
        .context("failed to connect to the database")?;
    store.migrate().await.context("failed to apply migrations")?;
    serve(config, Arc::new(store)).await
}

#[derive(Debug, Serialize)]
struct DayResponse {
    #[serde(flatten)]
    stat: DailyDonorStat,
    average_n_new_donors_last_30_days: i64,
}

async fn day_response(state: &AppState, date: NaiveDate, missing: String) -> Result<Json<DayResponse>, ApiError> {
    let summary = day_summary(state.store.as_ref(), date, ROLLING_WINDOW_DAYS)
        .await?
        .ok_or(ApiError::NotFound(missing))?;
    Ok(Json(DayResponse {
        stat: summary.stat,
        average_n_new_donors_last_30_days: summary.average_new_donors.round() as i64,
    }))
}

fn parse_date_param(raw: &str) -> Result<NaiveDate, ApiError> {
    parse_calendar_date(raw)
        .ok_or_else(|| ApiError::BadRequest(format!("Invalid date: {raw} (expected YYYY-MM-DD or DD.MM.YYYY)")))
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn today_handler(State(state): State<Arc<AppState>>) -> Result<Json<DayResponse>, ApiError> {
    let today = Local::now().date_naive();
    day_response(&state, today, "No data for today".to_string()).await
}

async fn stat_for_date_handler(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Result<Json<DayResponse>, ApiError> {
    let date = parse_date_param(&raw)?;
    day_response(&state, date, format!("No data for {date}")).await
}

#[derive(Debug, Deserialize, Default)]
struct NewDonorsQuery {
    date: Option<String>,
}

async fn new_donors_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NewDonorsQuery>,
) -> Result<Json<Vec<StoredAgreement>>, ApiError> {
    let date = match query.date.as_deref() {
        Some(raw) => parse_date_param(raw)?,
        None => Local::now().date_naive(),
    };
    Ok(Json(new_donors_on(state.store.as_ref(), date).await?))
}

async fn regions_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<RegionTotal>>, ApiError> {
    Ok(Json(region_breakdown(state.store.as_ref()).await?))
}

async fn products_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<ProductTotal>>, ApiError> {
    Ok(Json(product_breakdown(state.store.as_ref()).await?))
}

async fn push_donor_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<StoredAgreement>), ApiError> {
    let payload: serde_json::Value = serde_json::from_slice(&body).map_err(|_| PushError::NotAnObject)?;
    let fields = parse_push(&payload)?;
    let key = fields
        .dedup_key()
        .ok_or(PushError::MissingField("agreement.agreement_number"))?;

    let (stored, outcome) = upsert_agreement(state.store.as_ref(), &key, &fields).await?;
    info!(
        id = stored.id,
        person_id = key.person_id,
        agreement_id = %key.agreement_id,
        ?outcome,
        "recurring donor pushed"
    );
    let status = match outcome {
        UpsertOutcome::Created => StatusCode::CREATED,
        UpsertOutcome::Updated => StatusCode::OK,
    };
    Ok((status, Json(stored)))
}

#[derive(Debug, Deserialize)]
struct StatPayload {
    date: String,
    n_new_donors: i64,
    yearly_sum_new_donors: f64,
    n_total_new_donors: i64,
    yearly_sum_all_donors: f64,
}

async fn upsert_stat_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<DailyDonorStat>, ApiError> {
    let payload: StatPayload = serde_json::from_slice(&body)
        .map_err(|err| ApiError::BadRequest(format!("Invalid stats payload: {err}")))?;
    let date = parse_calendar_date(&payload.date)
        .ok_or(ApiError::Push(PushError::InvalidField("date")))?;
    if payload.n_new_donors < 0 || payload.n_total_new_donors < 0 {
        return Err(ApiError::BadRequest("Donor counts must not be negative".to_string()));
    }

    let stat = DailyDonorStat {
        date,
        n_new_donors: payload.n_new_donors,
        yearly_sum_new_donors: payload.yearly_sum_new_donors,
        n_total_new_donors: payload.n_total_new_donors,
        yearly_sum_all_donors: payload.yearly_sum_all_donors,
    };
    let stored = state.store.upsert_daily_stat(&stat).await?;
    info!(%date, n_new_donors = stored.n_new_donors, "daily stat upserted");
    Ok(Json(stored))
}

async fn import_handler(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ImportSummary>, ApiError> {
    let mut multipart = multipart.map_err(|err| ApiError::BadRequest(format!("Invalid upload: {err}")))?;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(format!("Invalid upload: {err}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| ApiError::BadRequest("Uploaded file has no name".to_string()))?;
        SheetFormat::from_file_name(&file_name)?;
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::BadRequest(format!("Invalid upload: {err}")))?;

        let importer = Importer::new(state.store.clone(), state.import_config.clone());
        let summary = importer.import_bytes(&file_name, bytes.to_vec()).await?;
        return Ok(Json(summary));
    }
    Err(ApiError::BadRequest("No file part named \"file\" in the upload".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use donorstats_storage::MemoryRecordStore;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const TOKEN: &str = "test-token";

    fn test_app(store: &MemoryRecordStore) -> Router {
        app(AppState::new(Arc::new(store.clone()), ApiToken::new(TOKEN)))
    }

    fn push_payload(amount: f64) -> Value {
        json!({
            "campaign_id": 3,
            "payment_method": "vippsrecurring",
            "classification_id_success": "S1",
            "name": {"name_id": 1001, "zip_code": "0150", "country_id": "NO", "nametype_id": "P"},
            "agreement": {
                "agreement_number": "500001",
                "producttype_id": "FG",
                "project_id": 7,
                "amount": amount,
                "interval": "Monthly",
                "startdate": "2025-03-01"
            }
        })
    }

    fn post_json(uri: &str, token: Option<&str>, body: &Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(resp: axum::response::Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn stat_body(date: NaiveDate, n_new_donors: i64) -> Value {
        json!({
            "date": date.format("%Y-%m-%d").to_string(),
            "n_new_donors": n_new_donors,
            "yearly_sum_new_donors": n_new_donors as f64 * 720.0,
            "n_total_new_donors": 48000,
            "yearly_sum_all_donors": 67680000.0
        })
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let resp = test_app(&MemoryRecordStore::new()).oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn today_is_404_until_a_stat_exists() {
        let store = MemoryRecordStore::new();
        let app = test_app(&store);

        let resp = app.clone().oneshot(get("/api/today")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(resp).await, json!({"error": "No data for today"}));

        let today = Local::now().date_naive();
        let resp = app
            .clone()
            .oneshot(post_json("/api/stats", Some(TOKEN), &stat_body(today - chrono::Duration::days(1), 20)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = app
            .clone()
            .oneshot(post_json("/api/stats", Some(TOKEN), &stat_body(today, 25)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.oneshot(get("/api/today")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["n_new_donors"], 25);
        assert_eq!(body["yearly_sum_new_donors"], 18000.0);
        assert_eq!(body["average_n_new_donors_last_30_days"], 23);
    }

    #[tokio::test]
    async fn stats_by_date_accepts_both_formats() {
        let store = MemoryRecordStore::new();
        let app = test_app(&store);
        let date = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        app.clone()
            .oneshot(post_json("/api/stats", Some(TOKEN), &stat_body(date, 30)))
            .await
            .unwrap();

        for uri in ["/api/stats/2025-03-01", "/api/stats/01.03.2025"] {
            let resp = app.clone().oneshot(get(uri)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(json_body(resp).await["average_n_new_donors_last_30_days"], 30);
        }

        let resp = app.clone().oneshot(get("/api/stats/2025-03-02")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = app.oneshot(get("/api/stats/yesterday")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stats_at_the_earliest_date_do_not_crash() {
        let store = MemoryRecordStore::new();
        let earliest = parse_calendar_date("-262143-01-05").unwrap();
        store
            .upsert_daily_stat(&DailyDonorStat {
                date: earliest,
                n_new_donors: 12,
                yearly_sum_new_donors: 8640.0,
                n_total_new_donors: 48000,
                yearly_sum_all_donors: 67680000.0,
            })
            .await
            .unwrap();

        let resp = test_app(&store)
            .oneshot(get("/api/stats/-262143-01-05"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["average_n_new_donors_last_30_days"], 12);
    }

    #[tokio::test]
    async fn writes_need_the_bearer_token() {
        let store = MemoryRecordStore::new();
        let app = test_app(&store);

        for token in [None, Some("wrong")] {
            let resp = app
                .clone()
                .oneshot(post_json("/api/recurring-donors", token, &push_payload(200.0)))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        }
        let resp = app
            .oneshot(post_json("/api/recurring-donors", None, &json!("not even an object")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(store.agreements().await.is_empty());
    }

    #[tokio::test]
    async fn unconfigured_token_locks_every_write() {
        let store = MemoryRecordStore::new();
        let app = app(AppState::new(Arc::new(store.clone()), ApiToken::disabled()));
        let resp = app
            .oneshot(post_json("/api/recurring-donors", Some(""), &push_payload(200.0)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn push_creates_then_updates_the_same_agreement() {
        let store = MemoryRecordStore::new();
        let app = test_app(&store);

        let resp = app
            .clone()
            .oneshot(post_json("/api/recurring-donors", Some(TOKEN), &push_payload(200.0)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = json_body(resp).await;
        assert_eq!(created["agreement_id"], "500001");
        assert_eq!(created["agreement_number"], "500001");
        assert_eq!(created["name_id"], 1001);

        let resp = app
            .oneshot(post_json("/api/recurring-donors", Some(TOKEN), &push_payload(350.0)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let updated = json_body(resp).await;
        assert_eq!(updated["id"], created["id"]);
        assert_eq!(updated["amount"], 350.0);
        assert_eq!(store.agreements().await.len(), 1);
    }

    #[tokio::test]
    async fn push_validation_errors_name_the_field() {
        let store = MemoryRecordStore::new();
        let app = test_app(&store);

        let mut missing = push_payload(200.0);
        missing["agreement"].as_object_mut().unwrap().remove("startdate");
        let resp = app
            .clone()
            .oneshot(post_json("/api/recurring-donors", Some(TOKEN), &missing))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(resp).await,
            json!({"error": "Missing required field: agreement.startdate"})
        );

        let mut invalid = push_payload(200.0);
        invalid["agreement"]["startdate"] = json!("2025/03/01");
        let resp = app
            .clone()
            .oneshot(post_json("/api/recurring-donors", Some(TOKEN), &invalid))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(resp).await,
            json!({"error": "Invalid value for field: agreement.startdate"})
        );

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/recurring-donors")
                    .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(store.agreements().await.is_empty());
    }

    fn multipart_upload(file_name: &str, contents: &str) -> Request<Body> {
        let boundary = "donorstats-boundary";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n\
             {contents}\r\n\
             --{boundary}--\r\n"
        );
        Request::builder()
            .method("POST")
            .uri("/api/import")
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn upload_returns_the_import_summary() {
        let store = MemoryRecordStore::new();
        let app = test_app(&store);
        let csv = "Navnenr;Avtalenummer;Produkttype;Beløp;Startdato;Fylke\n\
                   1001;500001;FG;200;01.03.2025;Oslo\n\
                   1002;500002;XX;100;01.03.2025;Oslo\n\
                   1003;500003;MI;150;01.03.2025;hordaland\n";

        let resp = app.clone().oneshot(multipart_upload("export.csv", csv)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let summary = json_body(resp).await;
        assert_eq!(summary["added"], 2);
        assert_eq!(summary["updated"], 0);
        assert_eq!(summary["skipped"], 1);
        assert_eq!(summary["details"].as_array().unwrap().len(), 1);

        let resp = app.clone().oneshot(get("/api/recurring-donors/regions")).await.unwrap();
        assert_eq!(
            json_body(resp).await,
            json!([
                {"region": "Oslo", "count": 1, "sum": 200.0},
                {"region": "Vestland", "count": 1, "sum": 150.0}
            ])
        );

        let resp = app.clone().oneshot(get("/api/recurring-donors/products")).await.unwrap();
        let products = json_body(resp).await;
        assert_eq!(products.as_array().unwrap().len(), 2);

        let resp = app
            .oneshot(get("/api/recurring-donors/new?date=2025-03-01"))
            .await
            .unwrap();
        assert_eq!(json_body(resp).await.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn upload_rejects_unsupported_files() {
        let store = MemoryRecordStore::new();
        let resp = test_app(&store)
            .oneshot(multipart_upload("donors.pdf", "whatever"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = json_body(resp).await;
        assert!(body["error"].as_str().unwrap().starts_with("unsupported file type"));
    }
}
