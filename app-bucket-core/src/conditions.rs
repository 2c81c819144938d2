//! Condition upsert shared by every status-bearing record.

use chrono::Utc;

use crate::records::{
    AppRecord, ArtifactRecord, BucketRecord, Condition, IngestionRecord, Record,
};

/// Records whose status carries a condition list.
pub trait HasConditions: Record {
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
}

impl HasConditions for BucketRecord {
    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.conditions
    }
}

impl HasConditions for ArtifactRecord {
    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.conditions
    }
}

impl HasConditions for AppRecord {
    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.conditions
    }
}

impl HasConditions for IngestionRecord {
    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.conditions
    }
}

/// Upserts a condition keyed by type. An existing condition with the same
/// status, reason and message only has its observed generation refreshed;
/// the transition time moves only when the status flips.
///
/// Returns true if the condition list changed.
pub fn set_condition<R: HasConditions>(
    obj: &mut R,
    type_: impl Into<String>,
    status: bool,
    reason: &str,
    message: impl Into<String>,
) -> bool {
    let generation = obj.meta().generation;
    let type_ = type_.into();
    let message = message.into();
    let conditions = obj.conditions_mut();

    match conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status == status
                && existing.reason == reason
                && existing.message == message
                && existing.observed_generation == generation
            {
                return false;
            }
            if existing.status != status {
                existing.last_transition_time = Utc::now();
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message;
            existing.observed_generation = generation;
            true
        }
        None => {
            conditions.push(Condition {
                type_,
                status,
                reason: reason.to_string(),
                message,
                last_transition_time: Utc::now(),
                observed_generation: generation,
            });
            true
        }
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}
