//! End-to-end behaviour of the gate middleware and payment routes.

use std::collections::HashMap;

use actix_web::http::header::{self, HeaderMap};
use actix_web::http::StatusCode;
use actix_web::middleware::from_fn;
use actix_web::web::Bytes;
use actix_web::{test, web, App, HttpRequest, HttpResponse, HttpServer};
use serde_json::{json, Value};
use x402::{PaymentResponse, SESSION_HEADER};
use x402_server::metrics::register_metrics;
use x402_server::middleware::payment_gate;
use x402_server::{routes, AppState, GateConfig};

const MERCHANT: &str = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";
// Nothing listens on port 1, so ledger lookups fail fast.
const DEAD_RPC: &str = "local=http://127.0.0.1:1";

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Reply {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

fn config(vars: &[(&str, &str)]) -> GateConfig {
    let mut map: HashMap<String, String> = HashMap::from([
        ("X402_MERCHANT_ADDRESS".to_string(), MERCHANT.to_string()),
        ("X402_PROTECTED_PATHS".to_string(), "/premium/*".to_string()),
        ("X402_RPC_ENDPOINTS".to_string(), DEAD_RPC.to_string()),
        ("X402_DEFAULT_ENDPOINT".to_string(), "local".to_string()),
        ("X402_VERIFY_TIMEOUT_SECS".to_string(), "2".to_string()),
    ]);
    for (k, v) in vars {
        map.insert(k.to_string(), v.to_string());
    }
    GateConfig::from_lookup(|key| map.get(key).cloned()).unwrap()
}

fn state(vars: &[(&str, &str)]) -> AppState {
    AppState::new(config(vars)).unwrap()
}

async fn content(req: HttpRequest) -> HttpResponse {
    HttpResponse::Ok().body(format!("content at {}", req.path()))
}

async fn send(state: &AppState, req: test::TestRequest) -> Reply {
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(from_fn(payment_gate))
            .configure(routes::health::configure)
            .configure(routes::payment::configure)
            .default_service(web::to(content)),
    )
    .await;
    let res = test::call_service(&app, req.to_request()).await;
    let status = res.status();
    let headers = res.headers().clone();
    let body = test::read_body(res).await;
    Reply {
        status,
        headers,
        body,
    }
}

fn get(path: &str, session: &str) -> test::TestRequest {
    test::TestRequest::get()
        .uri(path)
        .insert_header((SESSION_HEADER, session))
}

#[actix_rt::test]
async fn unprotected_request_passes_through_and_gets_a_session() {
    let state = state(&[]);
    let reply = send(&state, test::TestRequest::get().uri("/about")).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, "content at /about");
    assert!(reply
        .header("set-cookie")
        .is_some_and(|c| c.starts_with("x402_session=")));
}

#[actix_rt::test]
async fn protected_request_gets_402_description() {
    let state = state(&[]);
    let reply = send(&state, get("/premium/a", "s-1")).await;

    assert_eq!(reply.status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(reply.header("cache-control"), Some("no-store"));
    assert!(reply
        .header("content-type")
        .is_some_and(|c| c.starts_with("application/json")));

    let body = reply.json();
    assert_eq!(body["amount"], "0.01");
    assert_eq!(body["currency"], "SOL");
    assert_eq!(body["network"], "solana");
    assert_eq!(body["recipient"], MERCHANT);
    assert_eq!(body["description"], "Premium content access");
    assert!(body["facilitator"].is_null());
    assert!(body["paymentUrl"]
        .as_str()
        .unwrap()
        .starts_with(&format!("solana:{MERCHANT}?amount=0.01")));
    assert_eq!(body["accepts"][0]["payTo"], MERCHANT);
    assert!(body.get("error").is_none());
}

#[actix_rt::test]
async fn intent_is_stable_per_subject() {
    let state = state(&[]);
    let first = send(&state, get("/premium/a", "s-1")).await.json();
    let again = send(&state, get("/premium/a", "s-1")).await.json();
    let other = send(&state, get("/premium/a", "s-2")).await.json();
    assert_eq!(first["reference"], again["reference"]);
    assert_ne!(first["reference"], other["reference"]);
}

#[actix_rt::test]
async fn redirect_mode_sends_to_pay_route_without_looping() {
    let state = state(&[("X402_RESPONSE_MODE", "redirect")]);
    let reply = send(&state, get("/premium/a", "s-1")).await;

    assert_eq!(reply.status, StatusCode::FOUND);
    assert_eq!(reply.header("x-payment-required"), Some("true"));
    assert_eq!(reply.header("cache-control"), Some("no-store"));
    let location = reply.header("location").unwrap().to_string();
    assert_eq!(location, "/x402/pay?resource=%2Fpremium%2Fa");

    // The redirect target answers directly.
    let page = send(&state, get(&location, "s-1")).await;
    assert_eq!(page.status, StatusCode::OK);
    assert_eq!(page.header("cache-control"), Some("no-store"));
    let page = page.json();
    assert_eq!(page["protected"], true);
    assert_eq!(page["granted"], false);
    let intent = &page["intent"];
    assert_eq!(intent["amount"], "0.01");
    assert_eq!(intent["pollIntervalMs"], 3000);
    assert_eq!(intent["maxPollAttempts"], 40);
    let reference = intent["reference"].as_str().unwrap();
    assert_eq!(
        intent["statusUrl"],
        format!("/x402/status?reference={reference}&expectedAmount=0.01")
    );
}

#[actix_rt::test]
async fn pay_route_reports_unprotected_resources() {
    let state = state(&[]);
    let page = send(&state, get("/x402/pay?resource=%2Fabout", "s-1")).await;
    assert_eq!(page.status, StatusCode::OK);
    let page = page.json();
    assert_eq!(page["protected"], false);
    assert!(page.get("intent").is_none());

    let bad = send(&state, get("/x402/pay?resource=relative", "s-1")).await;
    assert_eq!(bad.status, StatusCode::BAD_REQUEST);
}

#[actix_rt::test]
async fn status_of_unknown_reference_is_404() {
    let state = state(&[]);
    let reply = send(&state, get("/x402/status?reference=nope", "s-1")).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    let body = reply.json();
    assert_eq!(body["status"], "error");
    assert_eq!(body["message"], "Payment reference not found.");
}

#[actix_rt::test]
async fn status_with_unreachable_ledger_is_pending() {
    let state = state(&[]);
    let reference = send(&state, get("/premium/a", "s-1")).await.json()["reference"]
        .as_str()
        .unwrap()
        .to_string();

    let reply = send(
        &state,
        get(&format!("/x402/status?reference={reference}&expectedAmount=0.01"), "s-1"),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.header("cache-control"), Some("no-store"));
    assert_eq!(
        reply.json(),
        json!({ "status": "pending", "message": "Payment not yet confirmed." })
    );
}

#[actix_rt::test]
async fn admin_token_bypasses_payment() {
    let state = state(&[("X402_ADMIN_TOKEN", "letmein")]);
    let reply = send(
        &state,
        get("/premium/a", "s-1").insert_header((header::AUTHORIZATION, "Bearer letmein")),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);

    let wrong = send(
        &state,
        get("/premium/a", "s-1").insert_header((header::AUTHORIZATION, "Bearer nope")),
    )
    .await;
    assert_eq!(wrong.status, StatusCode::PAYMENT_REQUIRED);
}

#[actix_rt::test]
async fn blocked_subject_is_denied_even_on_unprotected_paths() {
    let state = state(&[("X402_BLOCKED_SUBJECTS", "mallory")]);
    let reply = send(&state, get("/about", "mallory")).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(reply.json()["error"], "forbidden");

    let page = send(&state, get("/x402/pay?resource=/premium/a", "mallory")).await;
    assert_eq!(page.status, StatusCode::FORBIDDEN);
    assert!(page.json().get("intent").is_none());
}

#[actix_rt::test]
async fn path_tricks_do_not_reach_protected_files() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("premium")).unwrap();
    std::fs::write(dir.path().join("premium").join("article.html"), "SECRET").unwrap();
    std::fs::write(dir.path().join("index.html"), "home").unwrap();

    let state = state(&[]);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(from_fn(payment_gate))
            .configure(routes::payment::configure)
            .service(actix_files::Files::new("/", dir.path()).index_file("index.html")),
    )
    .await;

    for (path, expected) in [
        ("/premium/article.html", StatusCode::PAYMENT_REQUIRED),
        ("//premium/article.html", StatusCode::PAYMENT_REQUIRED),
        ("/premium//article.html", StatusCode::PAYMENT_REQUIRED),
        ("/premium/./article.html", StatusCode::PAYMENT_REQUIRED),
        ("/%70remium/article.html", StatusCode::PAYMENT_REQUIRED),
        ("/x402/../premium/article.html", StatusCode::BAD_REQUEST),
        ("/x402/%2e%2e/premium/article.html", StatusCode::BAD_REQUEST),
    ] {
        let res = test::call_service(&app, get(path, "s-1").to_request()).await;
        assert_eq!(res.status(), expected, "{path}");
        let body = test::read_body(res).await;
        assert!(!body.windows(6).any(|w| w == b"SECRET"), "{path}");
    }

    let res = test::call_service(&app, get("/index.html", "s-1").to_request()).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(test::read_body(res).await, "home");
}

#[actix_rt::test]
async fn missing_merchant_reports_not_configured() {
    let cfg = config(&[]);
    let cfg = GateConfig {
        merchant_address: None,
        ..cfg
    };
    let state = AppState::new(cfg).unwrap();

    let reply = send(&state, get("/premium/a", "s-1")).await;
    assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(reply.json()["error"], "not_configured");

    let open = send(&state, get("/about", "s-1")).await;
    assert_eq!(open.status, StatusCode::OK);
}

#[actix_rt::test]
async fn malformed_payment_header_is_explained() {
    let state = state(&[]);
    let reply = send(
        &state,
        get("/premium/a", "s-1").insert_header(("X-PAYMENT", "%%%")),
    )
    .await;
    assert_eq!(reply.status, StatusCode::PAYMENT_REQUIRED);
    assert!(reply.json()["error"]
        .as_str()
        .unwrap()
        .starts_with("malformed payment payload"));
}

#[actix_rt::test]
async fn health_and_metrics() {
    register_metrics();
    let state = state(&[("METRICS_TOKEN", "scrape")]);

    let health = send(&state, test::TestRequest::get().uri("/health")).await;
    assert_eq!(health.status, StatusCode::OK);
    let health = health.json();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["verification"], "ledger");
    assert_eq!(health["paymentsConfigured"], true);

    let denied = send(&state, test::TestRequest::get().uri("/metrics")).await;
    assert_eq!(denied.status, StatusCode::UNAUTHORIZED);

    // Drive one decision so the counter family is present.
    send(&state, get("/premium/a", "s-1")).await;
    let metrics = send(
        &state,
        test::TestRequest::get()
            .uri("/metrics")
            .insert_header((header::AUTHORIZATION, "Bearer scrape")),
    )
    .await;
    assert_eq!(metrics.status, StatusCode::OK);
    let text = String::from_utf8(metrics.body.to_vec()).unwrap();
    assert!(text.contains("x402_gate_decisions_total"));
}

async fn facilitator_verify(body: web::Json<Value>) -> HttpResponse {
    let requirements = &body["paymentRequirements"];
    if body["paymentPayload"]["payload"]["transaction"] == "bad" {
        return HttpResponse::BadRequest()
            .json(json!({ "isValid": false, "invalidReason": "signature verification failed" }));
    }
    HttpResponse::Ok().json(json!({
        "isValid": true,
        "transaction": "facSig",
        "amount": requirements["amount"],
    }))
}

fn facilitator_server() -> String {
    let server = HttpServer::new(|| App::new().route("/verify", web::post().to(facilitator_verify)))
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
    let addr = server.addrs()[0];
    actix_rt::spawn(server.run());
    format!("http://{addr}")
}

fn facilitator_state(url: &str, extra: &[(&str, &str)]) -> AppState {
    let mut vars = vec![
        ("X402_VERIFICATION_MODE", "facilitator"),
        ("X402_FACILITATOR_URL", url),
    ];
    vars.extend_from_slice(extra);
    state(&vars)
}

fn payment_header(reference: &str, transaction: &str) -> String {
    json!({
        "x402Version": 1,
        "scheme": "solana",
        "network": "solana",
        "reference": reference,
        "payload": { "transaction": transaction }
    })
    .to_string()
}

#[actix_rt::test]
async fn paid_request_is_served_and_granted() {
    let url = facilitator_server();
    let state = facilitator_state(&url, &[]);

    let required = send(&state, get("/premium/a", "s-1")).await;
    let body = required.json();
    assert_eq!(body["facilitator"], url.as_str());
    let reference = body["reference"].as_str().unwrap().to_string();

    let paid = send(
        &state,
        get("/premium/a", "s-1").insert_header(("X-PAYMENT", payment_header(&reference, "AQID"))),
    )
    .await;
    assert_eq!(paid.status, StatusCode::OK);
    assert_eq!(paid.body, "content at /premium/a");
    let receipt =
        PaymentResponse::from_header(paid.header("x-payment-response").unwrap(), None).unwrap();
    assert!(receipt.success);
    assert_eq!(receipt.settlement_id, "facSig");
    assert_eq!(receipt.reference, reference);

    // The grant covers later requests without proof.
    let later = send(&state, get("/premium/a", "s-1")).await;
    assert_eq!(later.status, StatusCode::OK);
    assert!(later.header("x-payment-response").is_none());

    // Another subject still pays.
    let other = send(&state, get("/premium/a", "s-2")).await;
    assert_eq!(other.status, StatusCode::PAYMENT_REQUIRED);

    // The status endpoint short-circuits an already confirmed reference.
    let status = send(&state, get(&format!("/x402/status?reference={reference}"), "s-1")).await;
    assert_eq!(
        status.json(),
        json!({ "status": "confirmed", "message": "Payment already confirmed." })
    );
}

#[actix_rt::test]
async fn rejected_or_foreign_proof_still_requires_payment() {
    let url = facilitator_server();
    let state = facilitator_state(&url, &[]);
    let reference = send(&state, get("/premium/a", "s-1")).await.json()["reference"]
        .as_str()
        .unwrap()
        .to_string();

    let rejected = send(
        &state,
        get("/premium/a", "s-1").insert_header(("X-PAYMENT", payment_header(&reference, "bad"))),
    )
    .await;
    assert_eq!(rejected.status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(rejected.json()["error"], "signature verification failed");

    let foreign = send(
        &state,
        get("/premium/a", "s-1").insert_header(("X-PAYMENT", payment_header("someone-else", "AQID"))),
    )
    .await;
    assert_eq!(foreign.status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(
        foreign.json()["error"],
        "payment reference does not match this request"
    );
}

#[actix_rt::test]
async fn grants_survive_restart_with_sqlite() {
    let url = facilitator_server();
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("gate.db");
    let db = db.to_str().unwrap();

    let first = facilitator_state(&url, &[("X402_DB_PATH", db)]);
    let reference = send(&first, get("/premium/a", "s-1")).await.json()["reference"]
        .as_str()
        .unwrap()
        .to_string();
    let paid = send(
        &first,
        get("/premium/a", "s-1").insert_header(("X-PAYMENT", payment_header(&reference, "AQID"))),
    )
    .await;
    assert_eq!(paid.status, StatusCode::OK);
    drop(first);

    let second = facilitator_state(&url, &[("X402_DB_PATH", db)]);
    let later = send(&second, get("/premium/a", "s-1")).await;
    assert_eq!(later.status, StatusCode::OK);

    // The confirmed reference outlives the restart as well.
    let status = send(&second, get(&format!("/x402/status?reference={reference}"), "s-9")).await;
    assert_eq!(status.json()["message"], "Payment already confirmed.");
}
