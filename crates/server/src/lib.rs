//! Server crate provides the HTTP surface of the booking backend.
//!
//! Routes:
//! - `GET /health`, `GET /metrics`
//! - `POST /api/v1/payments/callbacks` for the payment gateway
//! - the booking endpoints under `/api/v1/bookings` and field availability under
//!   `/api/v1/fields/{field_id}/booked-slots`
//!
//! Caller identity comes from headers set by the authentication proxy in front of
//! this service (see [`extract::Caller`]).

pub mod extract;
mod metrics;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use model::{
    BookedSlotsResponse, BookingResponse, BookingsPage, CreateBookingRequest, InvoiceSummary,
    Pagination, PaymentCallback, PaymentResponse,
};
use serde::{Deserialize, Serialize};
use service::{BookingService, PaymentService, ServiceError, ServiceMetrics};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};
use uuid::Uuid;

use extract::{ApiError, Caller, callback_token};
pub use metrics::HttpMetrics;

/// Application state shared between request handlers.
#[derive(Clone)]
pub struct AppState {
    pub bookings: Arc<dyn BookingService>,
    pub payments: Arc<dyn PaymentService>,
    pub metrics: Arc<ServiceMetrics>,
}

/// Server represents the HTTP server of the booking backend.
pub struct Server {
    port: u16,
    state: AppState,
    http_metrics: Arc<HttpMetrics>,
}

#[derive(Serialize)]
struct MessageResponse {
    message: &'static str,
}

#[derive(Deserialize)]
struct SlotsQuery {
    #[serde(default)]
    date: String,
}

impl Server {
    /// # Errors
    /// Returns an error if the HTTP metrics cannot be registered.
    pub fn new(port: u16, state: AppState) -> Result<Self> {
        let http_metrics = HttpMetrics::new(state.metrics.registry())
            .context("Failed to register HTTP metrics")?;
        Ok(Self {
            port,
            state,
            http_metrics: Arc::new(http_metrics),
        })
    }

    /// Serve until `shutdown` is notified, then finish in-flight requests.
    pub async fn start(&self, shutdown: Arc<Notify>) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("Failed to bind to port {}", self.port))?;
        info!(port = self.port, "HTTP server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.notified().await;
                info!("HTTP server received shutdown signal.");
            })
            .await
            .context("Server error")?;

        info!("HTTP server shut down gracefully");
        Ok(())
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/metrics", get(handle_metrics))
            .route("/api/v1/payments/callbacks", post(handle_payment_callback))
            .route(
                "/api/v1/bookings",
                post(handle_create_booking).get(handle_list_bookings),
            )
            .route("/api/v1/bookings/{id}", get(handle_get_booking))
            .route("/api/v1/bookings/{id}/cancel", put(handle_cancel_booking))
            .route("/api/v1/bookings/{id}/payments", get(handle_booking_payments))
            .route(
                "/api/v1/fields/{field_id}/booked-slots",
                get(handle_booked_slots),
            )
            .layer(axum::middleware::from_fn_with_state(
                self.http_metrics.clone(),
                metrics::track,
            ))
            .with_state(self.state.clone())
    }
}

async fn handle_health() -> &'static str {
    "OK"
}

async fn handle_metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

async fn handle_payment_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<PaymentCallback>, JsonRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    let Json(payload) = payload?;
    state
        .payments
        .apply_payment_callback(&payload, callback_token(&headers))
        .await?;
    Ok(Json(MessageResponse {
        message: "callback processed",
    }))
}

async fn handle_create_booking(
    State(state): State<AppState>,
    Caller(actor): Caller,
    payload: Result<Json<CreateBookingRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<InvoiceSummary>), ApiError> {
    let Json(req) = payload?;
    let invoice = state.bookings.create_booking(&req, &actor).await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

async fn handle_list_bookings(
    State(state): State<AppState>,
    Caller(actor): Caller,
    query: Result<Query<Pagination>, QueryRejection>,
) -> Result<Json<BookingsPage>, ApiError> {
    let Query(page) = query?;
    Ok(Json(
        state.bookings.get_user_bookings(actor.user_id, &page).await?,
    ))
}

/// Load a booking the caller may see: their own, or any for staff.
async fn visible_booking(
    state: &AppState,
    caller: &model::Actor,
    id: Uuid,
) -> Result<BookingResponse, ApiError> {
    let booking = state.bookings.get_booking_by_id(id).await?;
    if !caller.role.is_staff() && booking.user_id != caller.user_id.to_string() {
        return Err(ServiceError::NotFound("booking not found".into()).into());
    }
    Ok(booking)
}

async fn handle_get_booking(
    State(state): State<AppState>,
    Caller(actor): Caller,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<BookingResponse>, ApiError> {
    let Path(id) = id?;
    Ok(Json(visible_booking(&state, &actor, id).await?))
}

async fn handle_booking_payments(
    State(state): State<AppState>,
    Caller(actor): Caller,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Vec<PaymentResponse>>, ApiError> {
    let Path(id) = id?;
    visible_booking(&state, &actor, id).await?;
    Ok(Json(state.payments.get_payments_by_booking(id).await?))
}

async fn handle_cancel_booking(
    State(state): State<AppState>,
    Caller(actor): Caller,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    let Path(id) = id?;
    if actor.role.is_staff() {
        state.bookings.cancel_booking(id, &actor).await?;
    } else {
        state.bookings.cancel_user_booking(id, actor.user_id).await?;
    }
    Ok(Json(MessageResponse {
        message: "booking cancelled",
    }))
}

async fn handle_booked_slots(
    State(state): State<AppState>,
    field_id: Result<Path<Uuid>, PathRejection>,
    query: Result<Query<SlotsQuery>, QueryRejection>,
) -> Result<Json<BookedSlotsResponse>, ApiError> {
    let Path(field_id) = field_id?;
    let Query(query) = query?;
    Ok(Json(
        state
            .bookings
            .get_booked_slots(field_id, &query.date)
            .await?,
    ))
}
