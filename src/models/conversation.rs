use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Slot;
use crate::services::form::FormSession;

/// Where a conversation is in the booking flow. Each variant carries only the
/// data that is meaningful at that point, so a form never exists without a
/// successfully claimed slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Stage {
    Initial,
    AwaitingServiceType,
    AwaitingDayChoice {
        service: String,
        offered_days: Vec<NaiveDate>,
    },
    AwaitingTimeChoice {
        service: String,
        date: NaiveDate,
        offered_slots: Vec<Slot>,
        page: usize,
    },
    CollectingForm {
        form: FormSession,
    },
    AwaitingFinalConfirmation {
        form: FormSession,
    },
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Initial => "initial",
            Stage::AwaitingServiceType => "awaiting_service_type",
            Stage::AwaitingDayChoice { .. } => "awaiting_day_choice",
            Stage::AwaitingTimeChoice { .. } => "awaiting_time_choice",
            Stage::CollectingForm { .. } => "collecting_form",
            Stage::AwaitingFinalConfirmation { .. } => "awaiting_final_confirmation",
        }
    }

    /// The slot this conversation has claimed but not yet booked.
    pub fn held_claim(&self) -> Option<i64> {
        match self {
            Stage::CollectingForm { form } | Stage::AwaitingFinalConfirmation { form } => {
                Some(form.slot.id)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationState {
    pub address: String,
    pub stage: Stage,
    pub last_updated: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            stage: Stage::Initial,
            last_updated: Utc::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}
