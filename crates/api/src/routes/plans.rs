use axum::{extract::State, Json};
use serde::Serialize;
use wizpix_billing::PlanDefinition;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct PlansResponse {
    pub status: &'static str,
    pub plans: Vec<PlanDefinition>,
}

pub async fn list_plans(State(state): State<AppState>) -> Json<PlansResponse> {
    Json(PlansResponse {
        status: "success",
        plans: state.billing.catalog.list().to_vec(),
    })
}
