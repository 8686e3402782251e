//! Result routing.
//!
//! Clean files go to the destination, suspect files to the hazard archive,
//! never both and never neither. Files without a verdict stay in quarantine.

pub mod hazard;
mod router;

pub use hazard::{
    hazard_file_name, open_hazard_artifact, HazardKey, HazardManifest, HAZARD_MAGIC,
};
pub use router::{CollisionPolicy, ResultRouter, RouteOutcome};
