pub mod error;
pub mod handlers;
pub mod middleware;
pub mod multipart;

use std::path::PathBuf;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware as axum_middleware,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use crate::config::{RasterSettings, Settings, ToolSettings};

#[derive(Clone)]
pub struct AppState {
    pub uploads_dir: PathBuf,
    pub tools: ToolSettings,
    pub raster: RasterSettings,
}

impl AppState {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            uploads_dir: settings.uploads.directory.clone(),
            tools: settings.tools.clone(),
            raster: settings.raster.clone(),
        }
    }
}

pub fn build_router(state: AppState, max_request_bytes: u64) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/api/compress", post(handlers::compress_pdf))
        .route("/api/pdf-to-word", post(handlers::pdf_to_word))
        .route("/api/pdf-to-excel", post(handlers::pdf_to_excel))
        .route("/api/pdf-to-jpg", post(handlers::pdf_to_jpg))
        .route("/api/pdf-to-png", post(handlers::pdf_to_png))
        .route("/api/jpg-to-pdf", post(handlers::jpg_to_pdf))
        .route("/api/png-to-pdf", post(handlers::png_to_pdf))
        .route("/api/image-convert", post(handlers::image_convert))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_request_bytes as usize))
        .layer(CorsLayer::permissive())
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}
