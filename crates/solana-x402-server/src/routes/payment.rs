//! Payment presentation and status routes.
//!
//! Both live under `/x402`, which the gate exempts, so visiting them never
//! triggers another payment requirement.

use actix_web::{http::header, web, HttpMessage, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use x402::gate::MSG_CONFIRMED;
use x402::{
    PaymentStatus, Subject, DEFAULT_MAX_POLL_ATTEMPTS, DEFAULT_POLL_INTERVAL, SOLANA_NETWORK,
};

use crate::error::ServerError;
use crate::metrics;
use crate::session;
use crate::state::AppState;

pub const STATUS_ROUTE: &str = "/x402/status";

#[derive(Debug, Deserialize)]
pub struct PayQuery {
    pub resource: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQuery {
    pub reference: String,
    #[serde(default)]
    pub expected_amount: Option<String>,
}

/// What the payment page needs to render an intent and poll for it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPage {
    pub resource: String,
    pub protected: bool,
    /// Access already granted to this subject.
    pub granted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<PageIntent>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageIntent {
    pub amount: String,
    pub currency: String,
    pub network: String,
    pub recipient: String,
    pub reference: String,
    pub label: String,
    pub message: String,
    /// Solana Pay transfer-request URI.
    pub payment_url: String,
    pub status_url: String,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facilitator: Option<String>,
    pub poll_interval_ms: u64,
    pub max_poll_attempts: u32,
}

fn subject_of(req: &HttpRequest, state: &AppState) -> Subject {
    let from_gate = req.extensions().get::<Subject>().cloned();
    from_gate.unwrap_or_else(|| session::resolve_subject(req, state.config.admin_token.as_deref()).0)
}

/// GET /x402/pay?resource=<id> - Describe the payment a resource needs
pub async fn pay(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<PayQuery>,
) -> Result<HttpResponse, ServerError> {
    let resource = query.into_inner().resource;
    if !resource.starts_with('/') {
        return Err(ServerError::BadRequest(
            "resource must be an absolute path".to_string(),
        ));
    }
    let subject = subject_of(&req, &state);

    let page = match state.gate.payment_intent(&subject, &resource)? {
        None => PaymentPage {
            resource,
            protected: false,
            granted: true,
            intent: None,
        },
        Some(intent) => {
            let granted = state.gate.grants().has_valid_grant(&subject.id, &intent.resource_id);
            let amount = intent.display_amount();
            let status_url = format!(
                "{STATUS_ROUTE}?reference={}&expectedAmount={}",
                urlencoding::encode(&intent.reference),
                urlencoding::encode(&amount)
            );
            PaymentPage {
                resource,
                protected: true,
                granted,
                intent: Some(PageIntent {
                    payment_url: intent.to_uri(),
                    amount,
                    currency: intent.currency.code().to_string(),
                    network: SOLANA_NETWORK.to_string(),
                    recipient: intent.recipient,
                    reference: intent.reference,
                    label: intent.label,
                    message: intent.message,
                    status_url,
                    expires_at: intent.expires_at,
                    facilitator: state.facilitator_url().map(String::from),
                    poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
                    max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
                }),
            }
        }
    };

    Ok(HttpResponse::Ok()
        .insert_header((header::CACHE_CONTROL, "no-store"))
        .json(page))
}

/// GET /x402/status?reference=<ref>&expectedAmount=<decimal> - Poll a payment
pub async fn status(
    state: web::Data<AppState>,
    query: web::Query<StatusQuery>,
) -> Result<HttpResponse, ServerError> {
    let query = query.into_inner();
    let reference = query.reference.trim();
    if reference.is_empty() {
        return Err(ServerError::BadRequest("reference is required".to_string()));
    }

    let answer = match state
        .gate
        .check_status(reference, query.expected_amount.as_deref())
        .await
    {
        Ok(answer) => answer,
        Err(e) => {
            metrics::STATUS_CHECKS.with_label_values(&["error"]).inc();
            return Err(e.into());
        }
    };

    let label = match answer.status {
        PaymentStatus::Confirmed => "confirmed",
        PaymentStatus::Pending => "pending",
        PaymentStatus::Error => "error",
    };
    metrics::STATUS_CHECKS.with_label_values(&[label]).inc();
    if answer.message == MSG_CONFIRMED {
        metrics::GRANTS_ISSUED.inc();
        tracing::info!(reference = %reference, "payment confirmed via status check");
    }

    Ok(HttpResponse::Ok()
        .insert_header((header::CACHE_CONTROL, "no-store"))
        .json(answer))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/x402/pay", web::get().to(pay))
        .route(STATUS_ROUTE, web::get().to(status));
}
