use actix_web::web;
use std::sync::Arc;

use crate::coordinator::CoordinatorContext;

pub mod http;
pub mod sse;

#[derive(Clone)]
pub struct ApiContext {
    pub coordinator: Arc<CoordinatorContext>,
    /// Current application environment (dev, staging, prod).
    pub app_env: String,
}

pub fn configure(cfg: &mut web::ServiceConfig, ctx: ApiContext) {
    let ctx_data = web::Data::new(ctx);
    cfg.app_data(ctx_data.clone());
    http::configure(cfg);
    sse::configure(cfg);
}
