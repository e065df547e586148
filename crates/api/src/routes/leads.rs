use axum::{Json, extract::State, http::StatusCode};
use chrono::Utc;
use funil_infra::acme_client::{BatchItem, BatchOutcome, RequestOptions};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use validator::Validate;

use crate::error::ApiError;
use crate::observability;
use crate::state::AppState;
use crate::validation;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateLeadRequest {
    #[validate(length(min = 1, max = 200))]
    pub nome: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 8, max = 32))]
    pub telefone: String,
    #[validate(length(max = 200))]
    pub empresa: Option<String>,
    #[validate(length(max = 100))]
    pub cargo: Option<String>,
    #[validate(length(min = 1, max = 64))]
    pub interesse: String,
}

#[derive(Serialize)]
pub struct CreateLeadResponse {
    pub success: bool,
    pub lead: Value,
}

pub async fn create_lead(
    State(state): State<AppState>,
    Json(payload): Json<CreateLeadRequest>,
) -> Result<(StatusCode, Json<CreateLeadResponse>), ApiError> {
    validation::validate(&payload)?;

    let body = json!({
        "nome": payload.nome,
        "email": payload.email,
        "telefone": payload.telefone,
        "empresa": payload.empresa,
        "cargo": payload.cargo,
        "interesse": payload.interesse,
        "origem": "website",
        "data_cadastro": Utc::now().to_rfc3339(),
    });

    let lead = state
        .acme
        .request("/leads", RequestOptions::post(body))
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "lead creation failed upstream");
            observability::register_acme_integration_error("create_lead");
            ApiError::from(err)
        })?;

    observability::register_lead_created();
    Ok((
        StatusCode::CREATED,
        Json(CreateLeadResponse {
            success: true,
            lead,
        }),
    ))
}

#[derive(Serialize)]
pub struct FormDataResponse {
    pub cargos: Value,
    pub produtos: Value,
    pub configuracoes: Option<Value>,
}

/// Loads the dropdown data for the lead form in one concurrent batch.
/// Cargos and produtos are required; configuracoes is nice-to-have and
/// degrades to null when the CRM cannot serve it.
pub async fn form_data(State(state): State<AppState>) -> Result<Json<FormDataResponse>, ApiError> {
    let outcomes = state
        .acme
        .batch_request(vec![
            BatchItem::get("/leads/cargos"),
            BatchItem::get("/leads/produtos"),
            BatchItem::get("/leads/configuracoes"),
        ])
        .await;

    let [cargos, produtos, configuracoes]: [BatchOutcome; 3] =
        outcomes.try_into().map_err(|_| ApiError::Internal)?;

    let cargos = required_form_section(cargos, "cargos")?;
    let produtos = required_form_section(produtos, "produtos")?;
    let configuracoes = match configuracoes {
        BatchOutcome::Success(data) => Some(data),
        BatchOutcome::Failure(err) => {
            tracing::warn!(error = %err, "form configuracoes unavailable; serving without them");
            None
        }
    };

    Ok(Json(FormDataResponse {
        cargos,
        produtos,
        configuracoes,
    }))
}

fn required_form_section(outcome: BatchOutcome, section: &'static str) -> Result<Value, ApiError> {
    outcome.into_result().map_err(|err| {
        tracing::error!(error = %err, section, "form data load failed");
        observability::register_acme_integration_error("form_data");
        ApiError::BadGateway(format!("failed to load form data: {section}"))
    })
}
