pub mod backup;
pub mod certificate;
pub mod common;
pub mod init_job;
pub mod monitor;
pub mod rbac;
pub mod secret;
pub mod service;
pub mod topology;
pub mod workload;

pub use common::{API_VERSION, FIELD_MANAGER, KIND, owner_reference, standard_labels};
pub use topology::{MaterializeReport, RoleKind, RolePlan, materialize, plan_roles};
