use crate::error::ApiResult;
use crate::server::AppState;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json};
use bridge_store::{Employee, NewEmployee};
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route(
            "/api/v1/bridge/employees",
            get(list_employees).post(create_employee),
        )
        .route("/api/v1/bridge/employees/{id}", get(get_employee))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_employees(
    Extension(state): Extension<Arc<AppState>>,
) -> ApiResult<Json<Vec<Employee>>> {
    Ok(Json(state.store.list_employees().await?))
}

#[tracing::instrument(level = "info", skip_all)]
async fn create_employee(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<NewEmployee>,
) -> ApiResult<(StatusCode, Json<Employee>)> {
    let employee = state.store.insert_employee(req).await?;
    tracing::info!(employee_id = employee.id, "employee created");
    Ok((StatusCode::CREATED, Json(employee)))
}

#[tracing::instrument(level = "debug", skip_all, fields(employee_id = id))]
async fn get_employee(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Employee>> {
    Ok(Json(state.store.get_employee(id).await?))
}
