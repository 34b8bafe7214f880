use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum DisposalNoteStatus {
    #[sea_orm(string_value = "Draft")]
    Draft,
    #[sea_orm(string_value = "AssignedForPicking")]
    AssignedForPicking,
    #[sea_orm(string_value = "Picking")]
    Picking,
    #[sea_orm(string_value = "PendingApproval")]
    PendingApproval,
    #[sea_orm(string_value = "Completed")]
    Completed,
    #[sea_orm(string_value = "Cancelled")]
    Cancelled,
}

impl DisposalNoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "Draft",
            Self::AssignedForPicking => "AssignedForPicking",
            Self::Picking => "Picking",
            Self::PendingApproval => "PendingApproval",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Legal forward moves of the disposal workflow.
    ///
    /// `PendingApproval -> Picking` is the re-pick path.
    pub fn can_transition_to(&self, next: DisposalNoteStatus) -> bool {
        use DisposalNoteStatus::*;
        matches!(
            (self, next),
            (Draft, AssignedForPicking)
                | (AssignedForPicking, Picking)
                | (Picking, PendingApproval)
                | (PendingApproval, Picking)
                | (PendingApproval, Completed)
                | (Draft, Cancelled)
                | (AssignedForPicking, Cancelled)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "disposal_notes")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub code: String,
    pub warehouse_id: Uuid,
    pub status: DisposalNoteStatus,
    pub reason: String,
    pub requested_by: Uuid,
    pub assigned_to: Option<Uuid>,
    pub approved_by: Option<Uuid>,
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::DisposalNoteStatus::*;

    #[test]
    fn happy_path_transitions_are_legal() {
        assert!(Draft.can_transition_to(AssignedForPicking));
        assert!(AssignedForPicking.can_transition_to(Picking));
        assert!(Picking.can_transition_to(PendingApproval));
        assert!(PendingApproval.can_transition_to(Completed));
    }

    #[test]
    fn skipping_steps_is_rejected() {
        assert!(!Draft.can_transition_to(Completed));
        assert!(!Picking.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Picking));
        assert!(!Picking.can_transition_to(Cancelled));
    }
}
