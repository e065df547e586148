use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;

use funil_infra::acme_client::{AcmeApiClient, AcmeClientError, BatchItem, RequestOptions};
use funil_infra::config::AppConfig;

fn test_config(base: &str) -> AppConfig {
    AppConfig {
        app_env: "test".to_string(),
        port: 0,
        log_level: "info".to_string(),
        acme_base_url: base.to_string(),
        acme_auth_url: format!("{base}/auth"),
        acme_access_key: "test-access-key".to_string(),
        acme_secret_key: "test-secret-key".to_string(),
        acme_timeout_ms: 2_000,
        acme_retry_attempts: 3,
        acme_retry_delay_ms: 25,
        acme_cache_ttl_ms: 60_000,
        acme_refresh_buffer_seconds: 300,
    }
}

async fn spawn_stub(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind acme stub");
    let addr = listener.local_addr().expect("acme stub addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve acme stub");
    });
    format!("http://{addr}")
}

/// Auth endpoint handing out `token-1`, `token-2`, ... per exchange.
fn auth_routes(hits: Arc<AtomicUsize>) -> Router {
    Router::new().route(
        "/auth",
        post(move || {
            let hits = hits.clone();
            async move {
                let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                Json(json!({
                    "access_token": format!("token-{n}"),
                    "access_token_expires_in": 3_600,
                    "refresh_token": format!("refresh-{n}"),
                    "refresh_token_expires_in": 7_200,
                }))
            }
        }),
    )
}

fn counting_json(hits: Arc<AtomicUsize>, payload: Value) -> impl Fn() -> Json<Value> + Clone {
    move || {
        hits.fetch_add(1, Ordering::SeqCst);
        Json(payload.clone())
    }
}

#[tokio::test]
async fn repeated_get_is_served_from_cache() {
    let auth_hits = Arc::new(AtomicUsize::new(0));
    let hits = Arc::new(AtomicUsize::new(0));
    let app = auth_routes(auth_hits).route(
        "/leads/produtos",
        get({
            let handler = counting_json(hits.clone(), json!({ "produtos": ["plano-basico"] }));
            move || {
                let handler = handler.clone();
                async move { handler() }
            }
        }),
    );
    let base = spawn_stub(app).await;
    let client = AcmeApiClient::from_config(&test_config(&base));

    let first = client
        .request("/leads/produtos", RequestOptions::get())
        .await
        .expect("first");
    let second = client
        .request("/leads/produtos", RequestOptions::get())
        .await
        .expect("second");

    assert_eq!(first, second);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn post_is_never_cached() {
    let auth_hits = Arc::new(AtomicUsize::new(0));
    let hits = Arc::new(AtomicUsize::new(0));
    let app = auth_routes(auth_hits).route(
        "/leads",
        post({
            let hits = hits.clone();
            move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(json!({ "id": "lead-1" }))
                }
            }
        }),
    );
    let base = spawn_stub(app).await;
    let client = AcmeApiClient::from_config(&test_config(&base));

    let options = RequestOptions::post(json!({ "nome": "Ana" }));
    client
        .request("/leads", options.clone())
        .await
        .expect("first");
    client
        .request("/leads", options)
        .await
        .expect("second");

    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn concurrent_identical_requests_share_one_call() {
    let auth_hits = Arc::new(AtomicUsize::new(0));
    let hits = Arc::new(AtomicUsize::new(0));
    let app = auth_routes(auth_hits).route(
        "/leads/cargos",
        get({
            let hits = hits.clone();
            move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Json(json!({ "cargos": ["cto"] }))
                }
            }
        }),
    );
    let base = spawn_stub(app).await;
    let client = AcmeApiClient::from_config(&test_config(&base));

    let (a, b, c) = tokio::join!(
        client.request("/leads/cargos", RequestOptions::get()),
        client.request("/leads/cargos", RequestOptions::get()),
        client.request("/leads/cargos", RequestOptions::get())
    );

    let a = a.expect("a");
    let b = b.expect("b");
    let c = c.expect("c");
    assert_eq!(a, b);
    assert_eq!(b, c);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_posts_deduplicate_too() {
    let auth_hits = Arc::new(AtomicUsize::new(0));
    let hits = Arc::new(AtomicUsize::new(0));
    let app = auth_routes(auth_hits).route(
        "/leads",
        post({
            let hits = hits.clone();
            move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Json(json!({ "id": "lead-1" }))
                }
            }
        }),
    );
    let base = spawn_stub(app).await;
    let client = AcmeApiClient::from_config(&test_config(&base));

    let options = RequestOptions::post(json!({ "nome": "Ana" }));
    let (a, b) = tokio::join!(
        client.request("/leads", options.clone()),
        client.request("/leads", options.clone())
    );

    assert_eq!(a.expect("a"), b.expect("b"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn joined_callers_observe_the_same_failure() {
    let auth_hits = Arc::new(AtomicUsize::new(0));
    let hits = Arc::new(AtomicUsize::new(0));
    let app = auth_routes(auth_hits).route(
        "/leads/busca",
        get({
            let hits = hits.clone();
            move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    (
                        StatusCode::UNPROCESSABLE_ENTITY,
                        Json(json!({ "message": "filtro invalido", "code": "bad_filter" })),
                    )
                }
            }
        }),
    );
    let base = spawn_stub(app).await;
    let client = AcmeApiClient::from_config(&test_config(&base));

    let (a, b) = tokio::join!(
        client.request("/leads/busca", RequestOptions::get()),
        client.request("/leads/busca", RequestOptions::get())
    );

    for result in [a, b] {
        match result.expect_err("must fail") {
            AcmeClientError::Client {
                status,
                message,
                code,
            } => {
                assert_eq!(status, 422);
                assert_eq!(message, "filtro invalido");
                assert_eq!(code.as_deref(), Some("bad_filter"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transient_failure_is_retried_with_backoff() {
    let auth_hits = Arc::new(AtomicUsize::new(0));
    let hits = Arc::new(AtomicUsize::new(0));
    let app = auth_routes(auth_hits).route(
        "/leads/configuracoes",
        get({
            let hits = hits.clone();
            move || {
                let hits = hits.clone();
                async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            Json(json!({ "message": "temporarily broken" })),
                        )
                            .into_response()
                    } else {
                        Json(json!({ "origem_padrao": "website" })).into_response()
                    }
                }
            }
        }),
    );
    let base = spawn_stub(app).await;
    let client = AcmeApiClient::from_config(&test_config(&base));

    let data = client
        .request("/leads/configuracoes", RequestOptions::get())
        .await
        .expect("eventually succeeds");

    assert_eq!(data, json!({ "origem_padrao": "website" }));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let auth_hits = Arc::new(AtomicUsize::new(0));
    let hits = Arc::new(AtomicUsize::new(0));
    let app = auth_routes(auth_hits).route(
        "/leads/999",
        get({
            let hits = hits.clone();
            move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (
                        StatusCode::NOT_FOUND,
                        Json(json!({ "message": "lead nao encontrado", "code": "not_found" })),
                    )
                }
            }
        }),
    );
    let base = spawn_stub(app).await;
    let client = AcmeApiClient::from_config(&test_config(&base));

    let err = client
        .request("/leads/999", RequestOptions::get())
        .await
        .expect_err("must fail");

    assert!(matches!(err, AcmeClientError::Client { .. }));
    assert_eq!(err.status(), Some(404));
    assert_eq!(err.code(), Some("not_found"));
    assert!(!err.is_retryable());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unauthorized_renews_token_and_retries_once() {
    let auth_hits = Arc::new(AtomicUsize::new(0));
    let hits = Arc::new(AtomicUsize::new(0));
    // first token is rejected, the renewed one is accepted
    let app = auth_routes(auth_hits.clone()).route(
        "/leads/produtos",
        get({
            let hits = hits.clone();
            move |headers: HeaderMap| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let authorization = headers
                        .get("authorization")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    if authorization == "Bearer token-1" {
                        (
                            StatusCode::UNAUTHORIZED,
                            Json(json!({ "message": "token expirado" })),
                        )
                            .into_response()
                    } else {
                        Json(json!({ "produtos": [], "servido_para": authorization }))
                            .into_response()
                    }
                }
            }
        }),
    );
    let base = spawn_stub(app).await;
    let client = AcmeApiClient::from_config(&test_config(&base));

    let data = client
        .request("/leads/produtos", RequestOptions::get())
        .await
        .expect("retried with fresh token");

    assert_eq!(
        data.get("servido_para").and_then(Value::as_str),
        Some("Bearer token-2")
    );
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(auth_hits.load(Ordering::SeqCst), 2);
    assert!(client.auth().is_token_valid().await);
}

#[tokio::test]
async fn persistent_unauthorized_does_not_consume_the_retry_budget() {
    let auth_hits = Arc::new(AtomicUsize::new(0));
    let hits = Arc::new(AtomicUsize::new(0));
    let app = auth_routes(auth_hits).route(
        "/leads/produtos",
        get({
            let hits = hits.clone();
            move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (
                        StatusCode::UNAUTHORIZED,
                        Json(json!({ "message": "sempre expirado" })),
                    )
                }
            }
        }),
    );
    let base = spawn_stub(app).await;
    let client = AcmeApiClient::from_config(&test_config(&base));

    let err = client
        .request(
            "/leads/produtos",
            RequestOptions::get().with_retry_attempts(1),
        )
        .await
        .expect_err("must fail");

    assert!(matches!(err, AcmeClientError::Unauthorized { .. }));
    // one outer attempt, but two calls: the inline 401 retry is free
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn timeouts_surface_as_retryable_transport_errors() {
    let auth_hits = Arc::new(AtomicUsize::new(0));
    let hits = Arc::new(AtomicUsize::new(0));
    let app = auth_routes(auth_hits).route(
        "/leads/lento",
        get({
            let hits = hits.clone();
            move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Json(json!({ "nunca": "chega" }))
                }
            }
        }),
    );
    let base = spawn_stub(app).await;
    let mut config = test_config(&base);
    config.acme_timeout_ms = 100;
    config.acme_retry_attempts = 2;
    config.acme_retry_delay_ms = 10;
    let client = AcmeApiClient::from_config(&config);

    let err = client
        .request("/leads/lento", RequestOptions::get())
        .await
        .expect_err("must time out");

    assert!(matches!(err, AcmeClientError::Transport(_)));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn clear_cache_honors_the_pattern() {
    let auth_hits = Arc::new(AtomicUsize::new(0));
    let produto_hits = Arc::new(AtomicUsize::new(0));
    let cargo_hits = Arc::new(AtomicUsize::new(0));
    let config_hits = Arc::new(AtomicUsize::new(0));
    let app = auth_routes(auth_hits)
        .route(
            "/leads/produtos",
            get({
                let handler = counting_json(produto_hits.clone(), json!({ "produtos": [] }));
                move || {
                    let handler = handler.clone();
                    async move { handler() }
                }
            }),
        )
        .route(
            "/leads/cargos",
            get({
                let handler = counting_json(cargo_hits.clone(), json!({ "cargos": [] }));
                move || {
                    let handler = handler.clone();
                    async move { handler() }
                }
            }),
        )
        .route(
            "/config/settings",
            get({
                let handler = counting_json(config_hits.clone(), json!({ "tema": "claro" }));
                move || {
                    let handler = handler.clone();
                    async move { handler() }
                }
            }),
        );
    let base = spawn_stub(app).await;
    let client = AcmeApiClient::from_config(&test_config(&base));

    for endpoint in ["/leads/produtos", "/leads/cargos", "/config/settings"] {
        client
            .request(endpoint, RequestOptions::get())
            .await
            .expect("warm cache");
    }

    client.clear_cache(Some("/leads")).await;

    for endpoint in ["/leads/produtos", "/leads/cargos", "/config/settings"] {
        client
            .request(endpoint, RequestOptions::get())
            .await
            .expect("after pattern clear");
    }

    // lead entries were dropped, the unrelated one survived
    assert_eq!(produto_hits.load(Ordering::SeqCst), 2);
    assert_eq!(cargo_hits.load(Ordering::SeqCst), 2);
    assert_eq!(config_hits.load(Ordering::SeqCst), 1);

    client.clear_cache(None).await;
    client
        .request("/config/settings", RequestOptions::get())
        .await
        .expect("after full clear");
    assert_eq!(config_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn batch_isolates_failures_and_keeps_order() {
    let auth_hits = Arc::new(AtomicUsize::new(0));
    let broken_hits = Arc::new(AtomicUsize::new(0));
    let app = auth_routes(auth_hits)
        .route("/leads/cargos", get(|| async { Json(json!(["cto"])) }))
        .route(
            "/leads/produtos",
            get({
                let broken_hits = broken_hits.clone();
                move || {
                    let broken_hits = broken_hits.clone();
                    async move {
                        broken_hits.fetch_add(1, Ordering::SeqCst);
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            Json(json!({ "message": "catalogo fora do ar" })),
                        )
                    }
                }
            }),
        )
        .route(
            "/leads/configuracoes",
            get(|| async { Json(json!({ "origem_padrao": "website" })) }),
        );
    let base = spawn_stub(app).await;
    let client = AcmeApiClient::from_config(&test_config(&base));

    let outcomes = client
        .batch_request(vec![
            BatchItem::get("/leads/cargos"),
            BatchItem::get("/leads/produtos"),
            BatchItem::new("/leads/configuracoes", RequestOptions::get()),
        ])
        .await;

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[0].is_success());
    assert!(!outcomes[1].is_success());
    assert!(outcomes[2].is_success());
    // batch members fail fast: the 500 was not retried
    assert_eq!(broken_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn bearer_token_wins_over_a_caller_authorization_header() {
    let auth_hits = Arc::new(AtomicUsize::new(0));
    let app = auth_routes(auth_hits).route(
        "/leads/produtos",
        get(|headers: HeaderMap| async move {
            let authorization = headers
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();
            Json(json!({ "authorization_recebida": authorization }))
        }),
    );
    let base = spawn_stub(app).await;
    let client = AcmeApiClient::from_config(&test_config(&base));

    let data = client
        .request(
            "/leads/produtos",
            RequestOptions::get().with_header("Authorization", "Bearer forged"),
        )
        .await
        .expect("request");

    assert_eq!(
        data.get("authorization_recebida").and_then(Value::as_str),
        Some("Bearer token-1")
    );
}
