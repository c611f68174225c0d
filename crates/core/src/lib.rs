//! Keel core types: resource kinds, descriptors, plans, deadlines and errors.

#![forbid(unsafe_code)]

mod deadline;
mod descriptor;
mod error;
mod kind;
mod plan;

pub use deadline::Deadline;
pub use descriptor::{ResourceDescriptor, ResourceRef};
pub use error::{KeelError, KeelResult};
pub use kind::{KindInfo, ResourceKind, Stage};
pub use plan::DeploymentPlan;
