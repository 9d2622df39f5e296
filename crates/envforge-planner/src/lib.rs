mod compile;
mod error;
mod order;
mod types;
mod validate;

pub use compile::compile;
pub use error::{PlanError, SelectionError, ValidationError};
pub use types::{
    ExecutionPlan, InclusionReason, PlanEntry, Selection, Selector, PLAN_SCHEMA_VERSION,
};
pub use validate::{normalized_name, validate, validate_all, validate_installers, RESERVED_NAMES};

#[cfg(test)]
mod tests;
