//! OpenAPI document for every REST endpoint.

use utoipa::OpenApi;

use super::dto::{
    BookDirectRequest, BookHoldRequest, CancelRequest, CreateHoldRequest, EnqueueTaskRequest,
    EnqueueTaskResponse, ExecuteTaskRequest, ExecuteTaskResponse, TaskListResponse,
    TeachBackRequest, TeachBackResponse, TransitionResponse,
};
use super::handlers::system::{HealthResponse, TemplateCatalog};
use super::handlers::{appointments, system, tasks};
use crate::domain::{Appointment, AppointmentStatus, ScheduledTask, TaskPayload, TaskStatus};
use crate::error::{ErrorBody, ErrorResponse};
use crate::handlers::{HandlerOutcome, OutcomeStatus};
use crate::service::CycleReport;

/// Generated API description served at `/api-docs/openapi.json`.
#[derive(Debug, OpenApi)]
#[openapi(
    info(
        title = "visit-scheduler",
        description = "Deferred task scheduling and appointment lifecycle for study visits."
    ),
    paths(
        tasks::execute_task,
        tasks::enqueue_task,
        tasks::list_pending,
        tasks::get_task,
        tasks::reenqueue_task,
        appointments::create_hold,
        appointments::book_direct,
        appointments::get_appointment,
        appointments::confirm_booking,
        appointments::participant_confirms,
        appointments::mark_completed,
        appointments::mark_no_show,
        appointments::cancel,
        appointments::record_teach_back,
        system::health_handler,
        system::templates_handler,
        system::dispatch_handler,
    ),
    components(schemas(
        ExecuteTaskRequest,
        ExecuteTaskResponse,
        EnqueueTaskRequest,
        EnqueueTaskResponse,
        TaskListResponse,
        CreateHoldRequest,
        BookDirectRequest,
        BookHoldRequest,
        CancelRequest,
        TeachBackRequest,
        TeachBackResponse,
        TransitionResponse,
        Appointment,
        AppointmentStatus,
        ScheduledTask,
        TaskPayload,
        TaskStatus,
        HandlerOutcome,
        OutcomeStatus,
        CycleReport,
        HealthResponse,
        TemplateCatalog,
        ErrorResponse,
        ErrorBody,
    )),
    tags(
        (name = "Tasks", description = "Deferred task queue and synchronous execution"),
        (name = "Appointments", description = "Holds, bookings and lifecycle transitions"),
        (name = "System", description = "Health and operations"),
    )
)]
pub struct ApiDoc;
