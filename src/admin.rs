//! HTTP/JSON admin service: programmatic record registration and lookups
//! that share the resolution path with the UDP listener.

use std::net::Ipv6Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::{self, ADMIN_REQUESTS_TOTAL};
use crate::packet::{
    DnsPacket, Header, QueryType, Question, Record, RecordData, ResponseCode,
};
use crate::resolver::Resolver;
use crate::store::RecordStore;

// NOTE: any registered ttl below this is overridden.
const MINIMUM_ALLOWED_TTL: u32 = 60;

#[derive(Clone)]
pub struct AdminState {
    store: Arc<RecordStore>,
    resolver: Arc<Resolver>,
    shutdown_rx: watch::Receiver<bool>,
    refresh_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl AdminState {
    pub fn new(
        store: Arc<RecordStore>,
        resolver: Arc<Resolver>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            resolver,
            shutdown_rx,
            refresh_tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Re-registers the record every `ttl` seconds until shutdown.
    fn spawn_refresh(&self, record: Record) {
        let store = self.store.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            info!(
                "Automatically refreshing record every {}s: {}",
                record.ttl, record
            );
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs(record.ttl as u64)) => {
                        store.insert_or_update(record.clone());
                        info!("Refreshed record: {}", record);
                    }
                }
            }
            debug!("ttl refresh task exited for: {}", record.qname);
        });
        if let Ok(mut tasks) = self.refresh_tasks.lock() {
            tasks.push(handle);
        }
    }

    /// Waits for every auto-refresh task to observe the shutdown signal.
    pub async fn join_refresh_tasks(&self) {
        let handles: Vec<JoinHandle<()>> = match self.refresh_tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/records", post(insert_or_update))
        .route("/lookup", post(lookup))
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordDto {
    pub qname: String,
    pub qtype: u32,
    pub ttl: u32,
    pub data: RecordDataDto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RecordDataDto {
    A { addr: String },
    AAAA { addr: String },
    NS { host: String },
    CNAME { host: String },
    MX { priority: u32, host: String },
}

#[derive(Debug, Deserialize)]
pub struct InsertOrUpdateRequest {
    pub record: RecordDto,
    #[serde(default)]
    pub auto_refresh_ttl: bool,
}

#[derive(Debug, Serialize)]
pub struct InsertOrUpdateResponse {
    pub updated: bool,
}

#[derive(Debug, Deserialize)]
pub struct LookupRequest {
    pub qname: String,
    pub qtype: u32,
    #[serde(default)]
    pub recursion_desired: bool,
}

#[derive(Debug, Serialize)]
pub struct LookupResponse {
    pub answers: Vec<RecordDto>,
}

#[derive(Debug)]
pub enum AdminError {
    InvalidArgument(String),
    Internal(String),
    Unavailable(String),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AdminError::InvalidArgument(message) => (StatusCode::BAD_REQUEST, message),
            AdminError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
            AdminError::Unavailable(message) => (StatusCode::SERVICE_UNAVAILABLE, message),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

async fn insert_or_update(
    State(state): State<AdminState>,
    Json(request): Json<InsertOrUpdateRequest>,
) -> Result<Json<InsertOrUpdateResponse>, AdminError> {
    ADMIN_REQUESTS_TOTAL
        .with_label_values(&["insert_or_update"])
        .inc();

    let mut record = record_from_dto(&request.record)?;
    if record.ttl < MINIMUM_ALLOWED_TTL {
        warn!(
            "Request to register record with TTL below minimum ({}): {}",
            MINIMUM_ALLOWED_TTL, record.ttl
        );
        record.ttl = MINIMUM_ALLOWED_TTL;
    }

    let updated = state.store.insert_or_update(record.clone());
    if request.auto_refresh_ttl {
        state.spawn_refresh(record);
    }
    Ok(Json(InsertOrUpdateResponse { updated }))
}

async fn lookup(
    State(state): State<AdminState>,
    Json(request): Json<LookupRequest>,
) -> Result<Json<LookupResponse>, AdminError> {
    ADMIN_REQUESTS_TOTAL.with_label_values(&["lookup"]).inc();

    if request.qtype > u16::MAX as u32 {
        return Err(AdminError::InvalidArgument(format!(
            "qtype does not fit in 16 bits: {}",
            request.qtype
        )));
    }

    let query = DnsPacket {
        header: Header {
            id: rand::thread_rng().gen(),
            recursion_desired: request.recursion_desired,
            ..Header::default()
        },
        questions: vec![Question::new(
            request.qname.clone(),
            QueryType::from_num(request.qtype as u16),
        )],
        ..DnsPacket::default()
    };
    let query_raw = query
        .to_bytes()
        .map_err(|e| AdminError::Internal(format!("unable to encode lookup request: {}", e)))?;

    // Same dispatch path the UDP listener uses, minus the socket hop.
    let response_raw = state.resolver.handle_request(&query_raw).await;
    let response = DnsPacket::from_bytes(&response_raw)
        .map_err(|e| AdminError::Internal(format!("unable to decode lookup response: {}", e)))?;

    if response.header.response_code != ResponseCode::NOERROR {
        return Err(AdminError::Internal(format!(
            "lookup answered {}",
            response.header.response_code.as_str()
        )));
    }

    // Records of types the admin surface does not model are silently omitted.
    let answers = response.answers.iter().filter_map(dto_from_record).collect();
    Ok(Json(LookupResponse { answers }))
}

async fn health() -> &'static str {
    "OK"
}

async fn metrics_text() -> String {
    metrics::render()
}

fn record_from_dto(dto: &RecordDto) -> Result<Record, AdminError> {
    if dto.qtype > u16::MAX as u32 {
        return Err(AdminError::InvalidArgument(format!(
            "qtype does not fit in 16 bits: {}",
            dto.qtype
        )));
    }
    let qtype = QueryType::from_num(dto.qtype as u16);

    let data = match &dto.data {
        RecordDataDto::A { addr } => {
            let parts: Vec<&str> = addr.split('.').collect();
            if parts.len() != 4 {
                return Err(AdminError::InvalidArgument(
                    "Data type A requires exactly 4 elements.".to_string(),
                ));
            }
            let mut octets = [0u8; 4];
            for (i, part) in parts.iter().enumerate() {
                let value: u32 = part.parse().map_err(|_| {
                    AdminError::InvalidArgument(format!(
                        "Unable to parse IPv4 address from: {}",
                        addr
                    ))
                })?;
                if value > u8::MAX as u32 {
                    return Err(AdminError::InvalidArgument(format!(
                        "IPv4 part is greater than u8 max: {}",
                        value
                    )));
                }
                octets[i] = value as u8;
            }
            RecordData::A { addr: octets }
        }
        RecordDataDto::AAAA { addr } => {
            let parsed: Ipv6Addr = addr.parse().map_err(|_| {
                AdminError::InvalidArgument(format!("Unable to parse IPv6 address from: {}", addr))
            })?;
            RecordData::AAAA {
                addr: parsed.segments(),
            }
        }
        RecordDataDto::NS { host } => RecordData::NS { host: host.clone() },
        RecordDataDto::CNAME { host } => RecordData::CNAME { host: host.clone() },
        RecordDataDto::MX { priority, host } => {
            if *priority > u16::MAX as u32 {
                return Err(AdminError::InvalidArgument(format!(
                    "MX priority does not fit in 16 bits: {}",
                    priority
                )));
            }
            RecordData::MX {
                priority: *priority as u16,
                host: host.clone(),
            }
        }
    };

    let expected = match &data {
        RecordData::A { .. } => QueryType::A,
        RecordData::AAAA { .. } => QueryType::AAAA,
        RecordData::NS { .. } => QueryType::NS,
        RecordData::CNAME { .. } => QueryType::CNAME,
        RecordData::MX { .. } => QueryType::MX,
        RecordData::UNKNOWN { .. } => QueryType::UNKNOWN(0),
    };
    if qtype != expected {
        return Err(AdminError::InvalidArgument(format!(
            "record data shape does not match qtype {}",
            dto.qtype
        )));
    }

    Ok(Record {
        qname: dto.qname.clone(),
        qtype,
        dns_class: 1,
        ttl: dto.ttl,
        data,
    })
}

fn dto_from_record(record: &Record) -> Option<RecordDto> {
    let data = match &record.data {
        RecordData::A { addr } => RecordDataDto::A {
            addr: format!("{}.{}.{}.{}", addr[0], addr[1], addr[2], addr[3]),
        },
        RecordData::AAAA { addr } => RecordDataDto::AAAA {
            addr: Ipv6Addr::new(
                addr[0], addr[1], addr[2], addr[3], addr[4], addr[5], addr[6], addr[7],
            )
            .to_string(),
        },
        RecordData::NS { host } => RecordDataDto::NS { host: host.clone() },
        RecordData::CNAME { host } => RecordDataDto::CNAME { host: host.clone() },
        RecordData::MX { priority, host } => RecordDataDto::MX {
            priority: *priority as u32,
            host: host.clone(),
        },
        RecordData::UNKNOWN { .. } => return None,
    };
    Some(RecordDto {
        qname: record.qname.clone(),
        qtype: record.qtype.to_num() as u32,
        ttl: record.ttl,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn state() -> AdminState {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        let store = RecordStore::new(rx.clone());
        let resolver = Arc::new(Resolver::new(store.clone(), None));
        AdminState::new(store, resolver, rx)
    }

    async fn post_json(
        router: &Router,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn a_record_body(qname: &str, ttl: u32, addr: &str) -> serde_json::Value {
        json!({
            "record": {
                "qname": qname,
                "qtype": 1,
                "ttl": ttl,
                "data": { "type": "a", "addr": addr }
            }
        })
    }

    #[tokio::test]
    async fn low_ttl_is_clamped_to_the_minimum() {
        let state = state();
        let router = router(state.clone());

        let (status, body) =
            post_json(&router, "/records", a_record_body("clamp.example", 10, "10.0.0.1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["updated"], json!(false));

        let hits = state
            .store
            .query(&Question::new("clamp.example", QueryType::A));
        assert_eq!(hits.len(), 1);
        assert!(
            (MINIMUM_ALLOWED_TTL - 1..=MINIMUM_ALLOWED_TTL).contains(&hits[0].ttl),
            "ttl was {}",
            hits[0].ttl
        );
    }

    #[tokio::test]
    async fn repeated_insert_reports_an_update() {
        let state = state();
        let router = router(state);

        let body = a_record_body("twice.example", 120, "10.0.0.2");
        let (_, first) = post_json(&router, "/records", body.clone()).await;
        let (_, second) = post_json(&router, "/records", body).await;
        assert_eq!(first["updated"], json!(false));
        assert_eq!(second["updated"], json!(true));
    }

    #[tokio::test]
    async fn malformed_ipv4_addresses_are_rejected() {
        let state = state();
        let router = router(state.clone());

        for addr in ["10.0.0", "10.0.0.0.1", "10.0.0.x", "10.0.0.256"] {
            let (status, body) =
                post_json(&router, "/records", a_record_body("bad.example", 120, addr)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "addr {} was accepted", addr);
            assert!(body["error"].is_string());
        }
        assert_eq!(state.store.entry_count(), 0);
    }

    #[tokio::test]
    async fn mismatched_qtype_and_data_shape_is_rejected() {
        let state = state();
        let router = router(state);

        let (status, _) = post_json(
            &router,
            "/records",
            json!({
                "record": {
                    "qname": "mismatch.example",
                    "qtype": 15,
                    "ttl": 120,
                    "data": { "type": "a", "addr": "10.0.0.1" }
                }
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversize_mx_priority_is_rejected() {
        let state = state();
        let router = router(state);

        let (status, _) = post_json(
            &router,
            "/records",
            json!({
                "record": {
                    "qname": "mx.example",
                    "qtype": 15,
                    "ttl": 120,
                    "data": { "type": "mx", "priority": 70000, "host": "mail.example" }
                }
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn lookup_answers_from_the_store() {
        let state = state();
        let router = router(state.clone());

        state.store.insert_or_update(Record {
            qname: "lookup.example".to_string(),
            qtype: QueryType::A,
            dns_class: 1,
            ttl: 300,
            data: RecordData::A { addr: [10, 0, 0, 7] },
        });

        let (status, body) = post_json(
            &router,
            "/lookup",
            json!({ "qname": "lookup.example", "qtype": 1 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["answers"][0]["qname"], json!("lookup.example"));
        assert_eq!(body["answers"][0]["data"]["addr"], json!("10.0.0.7"));
    }

    #[tokio::test]
    async fn lookup_that_fails_resolution_is_internal() {
        let state = state();
        let router = router(state);

        let (status, body) = post_json(
            &router,
            "/lookup",
            json!({ "qname": "missing.example", "qtype": 1, "recursion_desired": true }),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn auto_refresh_registers_a_background_task() {
        let state = state();
        let router = router(state.clone());

        let (status, _) = post_json(
            &router,
            "/records",
            json!({
                "record": {
                    "qname": "refresh.example",
                    "qtype": 1,
                    "ttl": 120,
                    "data": { "type": "a", "addr": "10.0.0.9" }
                },
                "auto_refresh_ttl": true
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state.refresh_tasks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn health_and_metrics_respond() {
        let state = state();
        let router = router(state);

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("relaydns_"));
    }
}
