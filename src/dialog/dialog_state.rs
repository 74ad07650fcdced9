//! The dialog state machine: NULL -> EARLY -> CONFIRMED -> TERMINATED.
//!
//! Payload is carried on the variant itself (`Early(id, response)`,
//! `Confirmed(id)`, `Terminated(id, reason)`), rather than as a bare enum
//! discriminant plus side fields.

use super::dialog_id::{DialogId, EarlyDialogId};
use rsip::Response;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminatedReason {
    /// Transaction/dialog ended with a final non-2xx response.
    Rejected(rsip::StatusCode),
    /// BYE completed a confirmed dialog.
    Bye,
    /// Caller-initiated termination (e.g. CANCEL, local hangup).
    Cancelled,
    /// Transport or protocol failure forced termination.
    TransportError,
    /// Absolute transaction/dialog lifetime exceeded.
    Expired,
}

#[derive(Debug, Clone)]
pub enum DialogState {
    Null,
    Early(EarlyDialogId, Response),
    Confirmed(DialogId),
    Terminated(DialogId, Option<TerminatedReason>),
}

impl DialogState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, DialogState::Terminated(..))
    }

    pub fn is_early(&self) -> bool {
        matches!(self, DialogState::Early(..))
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, DialogState::Confirmed(..))
    }

    pub fn dialog_id(&self) -> Option<&DialogId> {
        match self {
            DialogState::Confirmed(id) | DialogState::Terminated(id, _) => Some(id),
            _ => None,
        }
    }

    pub fn early_dialog_id(&self) -> Option<&EarlyDialogId> {
        match self {
            DialogState::Early(id, _) => Some(id),
            _ => None,
        }
    }

    /// Whether `next` is a legal transition from `self`, per the monotonic
    /// ordering NULL -> EARLY -> CONFIRMED -> TERMINATED (TERMINATED is
    /// absorbing; NULL may go anywhere; EARLY may skip to CONFIRMED or
    /// TERMINATED).
    pub fn can_transition_to(&self, next: &DialogState) -> bool {
        match (self, next) {
            (DialogState::Terminated(..), _) => false,
            (DialogState::Null, _) => true,
            (DialogState::Early(..), DialogState::Early(..)) => true,
            (DialogState::Early(..), DialogState::Confirmed(..)) => true,
            (DialogState::Early(..), DialogState::Terminated(..)) => true,
            (DialogState::Confirmed(..), DialogState::Terminated(..)) => true,
            (DialogState::Confirmed(..), DialogState::Confirmed(..)) => true,
            _ => false,
        }
    }
}
