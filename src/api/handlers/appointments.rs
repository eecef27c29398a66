//! Appointment handlers: holds, bookings, lifecycle transitions, teach-back.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::api::dto::{
    BookDirectRequest, BookHoldRequest, CancelRequest, CreateHoldRequest, TeachBackRequest,
    TeachBackResponse, TransitionResponse,
};
use crate::app_state::AppState;
use crate::domain::{Appointment, AppointmentId};
use crate::error::{ErrorResponse, SchedulerError};

/// `POST /appointments/holds`: reserve a slot for a limited time.
///
/// # Errors
///
/// Returns [`SchedulerError::SlotTaken`] if another active appointment owns
/// the slot, or [`SchedulerError::SlotUnavailable`] if the provider
/// rejects it.
#[utoipa::path(
    post,
    path = "/api/v1/appointments/holds",
    tag = "Appointments",
    summary = "Place a hold",
    description = "Claims the slot in `held` status. The hold lapses after the configured TTL unless booked.",
    request_body = CreateHoldRequest,
    responses(
        (status = 201, description = "Hold placed", body = Appointment),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 409, description = "Slot taken or unavailable", body = ErrorResponse),
    )
)]
pub async fn create_hold(
    State(state): State<AppState>,
    Json(req): Json<CreateHoldRequest>,
) -> Result<impl IntoResponse, SchedulerError> {
    let hold = state.appointments.create_hold(req.into()).await?;
    Ok((StatusCode::CREATED, Json(hold)))
}

/// `POST /appointments`: book a slot without a hold.
///
/// # Errors
///
/// Returns [`SchedulerError::SlotTaken`] or [`SchedulerError::SlotUnavailable`].
#[utoipa::path(
    post,
    path = "/api/v1/appointments",
    tag = "Appointments",
    summary = "Book directly",
    description = "Claims the slot straight into `booked` and schedules the confirmation check, reminders and no-show rescue.",
    request_body = BookDirectRequest,
    responses(
        (status = 201, description = "Appointment booked", body = Appointment),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 409, description = "Slot taken or unavailable", body = ErrorResponse),
    )
)]
pub async fn book_direct(
    State(state): State<AppState>,
    Json(req): Json<BookDirectRequest>,
) -> Result<impl IntoResponse, SchedulerError> {
    let booking = state.appointments.book_direct(req.into()).await?;
    Ok((StatusCode::CREATED, Json(booking)))
}

/// `GET /appointments/{id}`: fetch one appointment.
///
/// # Errors
///
/// Returns [`SchedulerError::AppointmentNotFound`] if it does not exist.
#[utoipa::path(
    get,
    path = "/api/v1/appointments/{id}",
    tag = "Appointments",
    summary = "Get appointment",
    params(("id" = AppointmentId, Path, description = "Appointment identifier")),
    responses(
        (status = 200, description = "Appointment", body = Appointment),
        (status = 404, description = "Appointment not found", body = ErrorResponse),
    )
)]
pub async fn get_appointment(
    State(state): State<AppState>,
    Path(id): Path<AppointmentId>,
) -> Result<impl IntoResponse, SchedulerError> {
    let appointment = state.appointments.get(id).await?;
    Ok((StatusCode::OK, Json(appointment)))
}

/// `POST /appointments/{id}/book`: turn a hold into a booking.
///
/// # Errors
///
/// Returns [`SchedulerError::HoldExpired`] if the hold lapsed, or
/// [`SchedulerError::InvalidTransition`] if it is not held.
#[utoipa::path(
    post,
    path = "/api/v1/appointments/{id}/book",
    tag = "Appointments",
    summary = "Book a held slot",
    params(("id" = AppointmentId, Path, description = "Appointment identifier")),
    request_body = BookHoldRequest,
    responses(
        (status = 200, description = "Hold booked", body = TransitionResponse),
        (status = 404, description = "Appointment not found", body = ErrorResponse),
        (status = 409, description = "Hold lapsed or not held", body = ErrorResponse),
    )
)]
pub async fn confirm_booking(
    State(state): State<AppState>,
    Path(id): Path<AppointmentId>,
    Json(req): Json<BookHoldRequest>,
) -> Result<impl IntoResponse, SchedulerError> {
    let transition = state.appointments.confirm_booking(id, req.visit_type).await?;
    Ok((StatusCode::OK, Json(TransitionResponse::from(transition))))
}

/// `POST /appointments/{id}/confirm`: the participant confirms attendance.
///
/// # Errors
///
/// Returns [`SchedulerError::InvalidTransition`] unless the appointment is
/// booked.
#[utoipa::path(
    post,
    path = "/api/v1/appointments/{id}/confirm",
    tag = "Appointments",
    summary = "Participant confirms",
    params(("id" = AppointmentId, Path, description = "Appointment identifier")),
    responses(
        (status = 200, description = "Appointment confirmed", body = TransitionResponse),
        (status = 404, description = "Appointment not found", body = ErrorResponse),
        (status = 409, description = "Not booked", body = ErrorResponse),
    )
)]
pub async fn participant_confirms(
    State(state): State<AppState>,
    Path(id): Path<AppointmentId>,
) -> Result<impl IntoResponse, SchedulerError> {
    let transition = state.appointments.participant_confirms(id).await?;
    Ok((StatusCode::OK, Json(TransitionResponse::from(transition))))
}

/// `POST /appointments/{id}/complete`: the visit took place.
///
/// # Errors
///
/// Returns [`SchedulerError::InvalidTransition`] unless the appointment is
/// booked or confirmed.
#[utoipa::path(
    post,
    path = "/api/v1/appointments/{id}/complete",
    tag = "Appointments",
    summary = "Mark completed",
    params(("id" = AppointmentId, Path, description = "Appointment identifier")),
    responses(
        (status = 200, description = "Appointment completed", body = TransitionResponse),
        (status = 404, description = "Appointment not found", body = ErrorResponse),
        (status = 409, description = "Invalid transition", body = ErrorResponse),
    )
)]
pub async fn mark_completed(
    State(state): State<AppState>,
    Path(id): Path<AppointmentId>,
) -> Result<impl IntoResponse, SchedulerError> {
    let transition = state.appointments.mark_completed(id).await?;
    Ok((StatusCode::OK, Json(TransitionResponse::from(transition))))
}

/// `POST /appointments/{id}/no-show`: the participant did not attend.
///
/// # Errors
///
/// Returns [`SchedulerError::InvalidTransition`] unless the appointment is
/// booked or confirmed.
#[utoipa::path(
    post,
    path = "/api/v1/appointments/{id}/no-show",
    tag = "Appointments",
    summary = "Mark no-show",
    params(("id" = AppointmentId, Path, description = "Appointment identifier")),
    responses(
        (status = 200, description = "No-show recorded", body = TransitionResponse),
        (status = 404, description = "Appointment not found", body = ErrorResponse),
        (status = 409, description = "Invalid transition", body = ErrorResponse),
    )
)]
pub async fn mark_no_show(
    State(state): State<AppState>,
    Path(id): Path<AppointmentId>,
) -> Result<impl IntoResponse, SchedulerError> {
    let transition = state.appointments.mark_no_show(id).await?;
    Ok((StatusCode::OK, Json(TransitionResponse::from(transition))))
}

/// `POST /appointments/{id}/cancel`: cancel a live appointment.
///
/// # Errors
///
/// Returns [`SchedulerError::InvalidTransition`] if it already ended.
#[utoipa::path(
    post,
    path = "/api/v1/appointments/{id}/cancel",
    tag = "Appointments",
    summary = "Cancel",
    params(("id" = AppointmentId, Path, description = "Appointment identifier")),
    request_body = CancelRequest,
    responses(
        (status = 200, description = "Appointment cancelled", body = TransitionResponse),
        (status = 404, description = "Appointment not found", body = ErrorResponse),
        (status = 409, description = "Already ended", body = ErrorResponse),
    )
)]
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<AppointmentId>,
    Json(req): Json<CancelRequest>,
) -> Result<impl IntoResponse, SchedulerError> {
    let transition = state.appointments.cancel(id, req.reason).await?;
    Ok((StatusCode::OK, Json(TransitionResponse::from(transition))))
}

/// `POST /appointments/{id}/teach-back`: record a read-back result.
///
/// # Errors
///
/// Returns [`SchedulerError::InvalidRequest`] if the appointment is no
/// longer active.
#[utoipa::path(
    post,
    path = "/api/v1/appointments/{id}/teach-back",
    tag = "Appointments",
    summary = "Record teach-back",
    description = "Counts failed read-backs of the visit details. Once the configured limit is reached the response asks for a human handoff.",
    params(("id" = AppointmentId, Path, description = "Appointment identifier")),
    request_body = TeachBackRequest,
    responses(
        (status = 200, description = "Result recorded", body = TeachBackResponse),
        (status = 400, description = "Appointment not active", body = ErrorResponse),
        (status = 404, description = "Appointment not found", body = ErrorResponse),
    )
)]
pub async fn record_teach_back(
    State(state): State<AppState>,
    Path(id): Path<AppointmentId>,
    Json(req): Json<TeachBackRequest>,
) -> Result<impl IntoResponse, SchedulerError> {
    let outcome = state
        .appointments
        .record_teach_back(id, req.passed, req.idempotency_key.as_deref())
        .await?;
    Ok((StatusCode::OK, Json(TeachBackResponse::from(outcome))))
}

/// Appointment routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/appointments", post(book_direct))
        .route("/appointments/holds", post(create_hold))
        .route("/appointments/{id}", get(get_appointment))
        .route("/appointments/{id}/book", post(confirm_booking))
        .route("/appointments/{id}/confirm", post(participant_confirms))
        .route("/appointments/{id}/complete", post(mark_completed))
        .route("/appointments/{id}/no-show", post(mark_no_show))
        .route("/appointments/{id}/cancel", post(cancel))
        .route("/appointments/{id}/teach-back", post(record_teach_back))
}
