pub mod assistant;
pub mod bindings;
pub mod employees;
pub mod health;
pub mod messages;
pub mod platforms;
pub mod tasks;
pub mod webhooks;

use crate::http_auth::{AdminAuthPolicy, AdminAuthPolicyExt, require_admin_auth};
use crate::server::AppState;
use axum::{Extension, Router, middleware};
use std::sync::Arc;

pub fn router(state: Arc<AppState>, auth: AdminAuthPolicy) -> Router {
    let admin = Router::new()
        .merge(employees::router())
        .merge(bindings::router())
        .merge(messages::router())
        .merge(platforms::router())
        .merge(tasks::router())
        .merge(assistant::router())
        .layer(middleware::from_fn(require_admin_auth))
        .layer(Extension(AdminAuthPolicyExt(auth)));

    Router::new()
        .merge(webhooks::router())
        .merge(health::router())
        .merge(admin)
        .layer(Extension(state))
}
