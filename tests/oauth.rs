mod common;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use common::{batch_for, destination, serve, transformer_settings};
use event_relay::config::AdapterVersion;
use event_relay::features::StaticFeatures;
use event_relay::model::Connection;
use event_relay::oauth::{AccessToken, CredentialStore, DestinationInfo};
use event_relay::router::{
    proxy_adapter, PostParameters, ProxyRequestMetadata, ProxyRequestParams, ProxyRequestPayload,
    RouterTransformer,
};
use event_relay::stats::MemStats;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct RecordingStore {
    fetches: Arc<Mutex<Vec<String>>>,
    refreshes: Arc<Mutex<Vec<Value>>>,
    invalidated: Arc<Mutex<Vec<String>>>,
    refresh_results: Arc<Mutex<VecDeque<Result<AccessToken>>>>,
    refresh_delay: Duration,
}

fn token(access: &str) -> AccessToken {
    AccessToken {
        secret: json!({ "access_token": access }),
        expiration_date: None,
    }
}

#[async_trait]
impl CredentialStore for RecordingStore {
    async fn fetch(&self, destination: &DestinationInfo) -> Result<AccessToken> {
        self.fetches.lock().await.push(destination.key());
        Ok(token("t1"))
    }

    async fn refresh(&self, _destination: &DestinationInfo, stale: &AccessToken) -> Result<AccessToken> {
        tokio::time::sleep(self.refresh_delay).await;
        self.refreshes.lock().await.push(stale.secret.clone());
        self.refresh_results
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(token("t2")))
    }

    async fn invalidate(&self, destination: &DestinationInfo) -> Result<()> {
        self.invalidated.lock().await.push(destination.id.clone());
        Ok(())
    }
}

fn transformer(url: &str, store: RecordingStore) -> RouterTransformer {
    let settings = transformer_settings(url);
    settings.oauth_v2_enabled.store(true);
    RouterTransformer::new(
        settings,
        Some(Arc::new(store)),
        Arc::new(StaticFeatures::default()),
        Arc::new(MemStats::new()),
    )
    .unwrap()
}

/// `/routerTransform` answering every job with `category`; records the
/// credential header.
async fn transform_service(category: &'static str, seen: Arc<Mutex<Vec<String>>>) -> String {
    let app = Router::new().route(
        "/routerTransform",
        post(move |headers: HeaderMap, body: Bytes| {
            let seen = seen.clone();
            async move {
                if let Some(v) = headers.get("x-rudder-dest-info") {
                    seen.lock().await.push(v.to_str().unwrap().to_string());
                }
                let request: Value = serde_json::from_slice(&body).unwrap();
                let mut records = common::echo_records(&request, 401);
                for record in records.as_array_mut().unwrap() {
                    record["authErrorCategory"] = json!(category);
                    record["error"] = json!("token expired");
                }
                ([("apiversion", "2")], Json(json!({ "output": records })))
            }
        }),
    );
    serve(app).await
}

#[tokio::test]
async fn refresh_token_overrides_status_and_refreshes() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let url = transform_service("REFRESH_TOKEN", seen.clone()).await;
    let store = RecordingStore::default();
    let rt = transformer(&url, store.clone());

    let message = batch_for(&[1, 2], &destination("d-1", true));
    let jobs = rt.transform("ROUTER_TRANSFORM", &message).await.unwrap();

    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.status_code == 500));
    assert!(jobs.iter().all(|j| j.error == "token expired"));
    assert_eq!(store.fetches.lock().await.len(), 1);
    assert_eq!(*store.refreshes.lock().await, vec![json!({ "access_token": "t1" })]);

    let header: Value = serde_json::from_str(&seen.lock().await[0]).unwrap();
    assert_eq!(header["secret"]["access_token"], "t1");

    // the refreshed token is used next time
    rt.transform("ROUTER_TRANSFORM", &batch_for(&[3], &destination("d-1", true)))
        .await
        .unwrap();
    let header: Value = serde_json::from_str(&seen.lock().await[1]).unwrap();
    assert_eq!(header["secret"]["access_token"], "t2");
    assert_eq!(store.fetches.lock().await.len(), 1);
}

#[tokio::test]
async fn failed_refresh_reports_the_error() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let url = transform_service("REFRESH_TOKEN", seen).await;
    let store = RecordingStore::default();
    store
        .refresh_results
        .lock()
        .await
        .push_back(Err(anyhow!("invalid_grant")));
    let rt = transformer(&url, store.clone());

    let jobs = rt
        .transform("ROUTER_TRANSFORM", &batch_for(&[1], &destination("d-1", true)))
        .await
        .unwrap();
    assert_eq!(jobs[0].status_code, 500);
    assert!(jobs[0].error.contains("invalid_grant"));
}

#[tokio::test]
async fn inactive_auth_invalidates_credentials() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let url = transform_service("AUTH_STATUS_INACTIVE", seen).await;
    let store = RecordingStore::default();
    let rt = transformer(&url, store.clone());

    let jobs = rt
        .transform("ROUTER_TRANSFORM", &batch_for(&[1], &destination("d-1", true)))
        .await
        .unwrap();
    assert_eq!(jobs[0].status_code, 400);
    assert!(jobs[0].error.contains("revoked"));
    assert_eq!(*store.invalidated.lock().await, vec!["d-1".to_string()]);

    // the cached token was dropped
    rt.transform("ROUTER_TRANSFORM", &batch_for(&[2], &destination("d-1", true)))
        .await
        .unwrap();
    assert_eq!(store.fetches.lock().await.len(), 2);
}

#[tokio::test]
async fn non_oauth_destinations_skip_credentials() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let url = transform_service("REFRESH_TOKEN", seen.clone()).await;
    let store = RecordingStore::default();
    let rt = transformer(&url, store.clone());

    let jobs = rt
        .transform("ROUTER_TRANSFORM", &batch_for(&[1], &destination("d-1", false)))
        .await
        .unwrap();
    assert_eq!(jobs[0].status_code, 401);
    assert!(store.fetches.lock().await.is_empty());
    assert!(seen.lock().await.is_empty());
}

#[tokio::test]
async fn concurrent_refreshes_for_one_destination_run_once() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let url = transform_service("REFRESH_TOKEN", seen).await;
    let store = RecordingStore {
        refresh_delay: Duration::from_millis(100),
        ..Default::default()
    };
    let rt = Arc::new(transformer(&url, store.clone()));

    let mut handles = Vec::new();
    for id in 0..4 {
        let rt = Arc::clone(&rt);
        handles.push(tokio::spawn(async move {
            rt.transform("ROUTER_TRANSFORM", &batch_for(&[id], &destination("d-1", true)))
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        let jobs = handle.await.unwrap();
        assert_eq!(jobs[0].status_code, 500);
    }
    // every caller saw t1; only the first refresh reaches the store
    assert_eq!(store.refreshes.lock().await.len(), 1);
}

#[tokio::test]
async fn proxy_interceptor_overrides_every_job() {
    let app = Router::new().route(
        "/v0/destinations/webhook/proxy",
        post(|| async {
            Json(json!({
                "output": { "status": 401, "message": "expired", "authErrorCategory": "AUTH_STATUS_INACTIVE" }
            }))
        }),
    );
    let url = serve(app).await;
    let store = RecordingStore::default();
    let rt = transformer(&url, store.clone());
    let dest = destination("d-1", true);

    let params = ProxyRequestParams {
        response_data: ProxyRequestPayload {
            post_parameters: PostParameters {
                kind: "REST".into(),
                endpoint: "https://api.example.com".into(),
                ..Default::default()
            },
            metadata: vec![
                ProxyRequestMetadata {
                    job_id: 1,
                    ..Default::default()
                },
                ProxyRequestMetadata {
                    job_id: 2,
                    ..Default::default()
                },
            ],
            destination_config: Map::new(),
        },
        dest_name: "WEBHOOK".into(),
        adapter: proxy_adapter(AdapterVersion::V0, &url),
        dest_info: Some(DestinationInfo::new("ws-1", &dest)),
        connection: Connection::default(),
    };

    let resp = rt.proxy_request(&CancellationToken::new(), &params).await;
    assert_eq!(resp.status_code, 400);
    assert_eq!(resp.job_status_codes[&1], 400);
    assert_eq!(resp.job_status_codes[&2], 400);
    assert!(resp.job_bodies[&2].contains("revoked"));
    assert_eq!(*store.invalidated.lock().await, vec!["d-1".to_string()]);
}
