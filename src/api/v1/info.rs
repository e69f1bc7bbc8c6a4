use crate::engine::RaceEngine;
use axum::{
    response::{IntoResponse, Response},
    Extension,
};
use axum_extra::response::ErasedJson;
use http::StatusCode;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StatusResponse {
    connections: usize,
    rooms: usize,
    races_completed: u64,
    uptime_seconds: u64,
}

impl IntoResponse for StatusResponse {
    fn into_response(self) -> Response {
        // ErasedJson so the gauges are readable in a browser.
        (StatusCode::OK, ErasedJson::pretty(self)).into_response()
    }
}

pub(crate) async fn status(Extension(engine): Extension<Arc<RaceEngine>>) -> StatusResponse {
    let snapshot = engine.status_snapshot();
    StatusResponse {
        connections: snapshot.connections,
        rooms: snapshot.rooms,
        races_completed: snapshot.races_completed,
        uptime_seconds: snapshot.uptime_seconds,
    }
}
