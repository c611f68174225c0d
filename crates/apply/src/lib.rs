//! Keel apply: idempotent create-or-update of single objects, manifest
//! parsing and minimal diffs.

#![forbid(unsafe_code)]

mod manifest;
mod merge;
mod reconciler;

pub use manifest::{parse_manifests, ManifestLimits};
pub use merge::{converged, diff_summary, fold_string_data, merge_onto_live, strip_noisy, DiffSummary};
pub use reconciler::{ReconcileAction, ReconcileFailure, Reconciled, Reconciler, RetryPolicy};
