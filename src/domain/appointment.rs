//! Appointment record and its lifecycle rules.
//!
//! The transition table lives here as pure functions so both storage
//! backends and the service layer agree on what is legal:
//!
//! ```text
//!  none --hold--> held
//!  held --book--> booked
//!  held --expire_hold--> expired_unconfirmed
//!  booked --confirm--> confirmed
//!  booked --expire_unconfirmed--> expired_unconfirmed
//!  booked|confirmed --complete--> completed
//!  booked|confirmed --mark_no_show--> no_show
//!  held|booked|confirmed --cancel--> cancelled
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::AppointmentId;
use crate::error::SchedulerError;

/// Status of an appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    /// Provisional claim on the slot.
    Held,
    /// Booked, awaiting participant confirmation.
    Booked,
    /// Booked and confirmed by the participant.
    Confirmed,
    /// The visit happened.
    Completed,
    /// The participant did not attend.
    NoShow,
    /// Cancelled by the participant or staff.
    Cancelled,
    /// The hold or the confirmation window lapsed.
    ExpiredUnconfirmed,
}

impl AppointmentStatus {
    /// Statuses that occupy their slot.
    pub const ACTIVE: [Self; 3] = [Self::Held, Self::Booked, Self::Confirmed];

    /// Returns `true` for `held`, `booked` and `confirmed`.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Held | Self::Booked | Self::Confirmed)
    }

    /// Returns `true` once no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Returns the storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Held => "held",
            Self::Booked => "booked",
            Self::Confirmed => "confirmed",
            Self::Completed => "completed",
            Self::NoShow => "no_show",
            Self::Cancelled => "cancelled",
            Self::ExpiredUnconfirmed => "expired_unconfirmed",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "held" => Ok(Self::Held),
            "booked" => Ok(Self::Booked),
            "confirmed" => Ok(Self::Confirmed),
            "completed" => Ok(Self::Completed),
            "no_show" => Ok(Self::NoShow),
            "cancelled" => Ok(Self::Cancelled),
            "expired_unconfirmed" => Ok(Self::ExpiredUnconfirmed),
            other => Err(SchedulerError::Internal(format!(
                "unknown appointment status: {other}"
            ))),
        }
    }
}

/// A lifecycle action applied to an existing appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    /// `held → booked`.
    Book,
    /// `held → expired_unconfirmed`.
    ExpireHold,
    /// `booked → confirmed`.
    Confirm,
    /// `booked → expired_unconfirmed`.
    ExpireUnconfirmed,
    /// `booked | confirmed → completed`.
    Complete,
    /// `booked | confirmed → no_show`.
    MarkNoShow,
    /// `held | booked | confirmed → cancelled`.
    Cancel,
}

impl LifecycleAction {
    /// Returns the status the action leads to from `from`, if legal.
    #[must_use]
    pub const fn apply(self, from: AppointmentStatus) -> Option<AppointmentStatus> {
        use AppointmentStatus as S;
        match (self, from) {
            (Self::Book, S::Held) => Some(S::Booked),
            (Self::ExpireHold, S::Held) | (Self::ExpireUnconfirmed, S::Booked) => {
                Some(S::ExpiredUnconfirmed)
            }
            (Self::Confirm, S::Booked) => Some(S::Confirmed),
            (Self::Complete, S::Booked | S::Confirmed) => Some(S::Completed),
            (Self::MarkNoShow, S::Booked | S::Confirmed) => Some(S::NoShow),
            (Self::Cancel, S::Held | S::Booked | S::Confirmed) => Some(S::Cancelled),
            _ => None,
        }
    }

    /// Returns the action name used in errors and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Book => "book",
            Self::ExpireHold => "expire_hold",
            Self::Confirm => "confirm",
            Self::ExpireUnconfirmed => "expire_unconfirmed",
            Self::Complete => "complete",
            Self::MarkNoShow => "mark_no_show",
            Self::Cancel => "cancel",
        }
    }
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bookable-resource instance.
///
/// At most one appointment per `resource_key` may be active at any time.
/// Records are never deleted; terminal ones are kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Appointment {
    /// Unique appointment identifier.
    pub appointment_id: AppointmentId,
    /// Participant holding or owning the booking.
    pub owner_id: String,
    /// Slot identity (e.g. trial + site + slot time).
    pub resource_key: String,
    /// Scheduled visit start.
    pub slot_start: DateTime<Utc>,
    /// Visit type chosen at booking.
    pub visit_type: Option<String>,
    /// Current status.
    pub status: AppointmentStatus,
    /// Hold expiry, set while `held`.
    pub slot_held_until: Option<DateTime<Utc>>,
    /// Deadline for participant confirmation, set on booking.
    pub confirmation_due_at: Option<DateTime<Utc>>,
    /// Failed verbal read-backs, capped.
    pub teach_back_attempts: u32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    /// Creates a fresh hold on `resource_key` until `held_until`.
    #[must_use]
    pub fn new_hold(
        owner_id: impl Into<String>,
        resource_key: impl Into<String>,
        slot_start: DateTime<Utc>,
        held_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            appointment_id: AppointmentId::new(),
            owner_id: owner_id.into(),
            resource_key: resource_key.into(),
            slot_start,
            visit_type: None,
            status: AppointmentStatus::Held,
            slot_held_until: Some(held_until),
            confirmation_due_at: None,
            teach_back_attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a booking without a prior hold.
    #[must_use]
    pub fn new_booking(
        owner_id: impl Into<String>,
        resource_key: impl Into<String>,
        slot_start: DateTime<Utc>,
        visit_type: Option<String>,
        confirmation_due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            appointment_id: AppointmentId::new(),
            owner_id: owner_id.into(),
            resource_key: resource_key.into(),
            slot_start,
            visit_type,
            status: AppointmentStatus::Booked,
            slot_held_until: None,
            confirmation_due_at: Some(confirmation_due_at),
            teach_back_attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns `true` if this is a hold whose expiry has passed.
    #[must_use]
    pub fn hold_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.status == AppointmentStatus::Held
            && self.slot_held_until.is_some_and(|until| until <= now)
    }

    /// Returns a copy moved through `action`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidTransition`] if the action is not
    /// legal from the current status.
    pub fn transitioned(
        &self,
        action: LifecycleAction,
        now: DateTime<Utc>,
    ) -> Result<Self, SchedulerError> {
        let status =
            action
                .apply(self.status)
                .ok_or_else(|| SchedulerError::InvalidTransition {
                    appointment_id: self.appointment_id,
                    from: self.status,
                    action,
                })?;
        let mut next = self.clone();
        next.status = status;
        next.updated_at = now;
        Ok(next)
    }
}
