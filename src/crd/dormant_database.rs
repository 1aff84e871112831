use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::mongodb::MongoDBSpec;

/// Kind label value for dormant records created from MongoDB resources
pub const MONGODB_KIND: &str = "MongoDB";

/// DormantDatabase retains the origin of a paused database.
///
/// It exists for at most one database per namespace and name. A finalizer
/// keeps volumes and credentials referenced until the record is either
/// resumed (deleted after a matching create) or wiped out.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "mongodb-operator.smoketurner.com",
    version = "v1alpha1",
    kind = "DormantDatabase",
    plural = "dormantdatabases",
    shortname = "drmn",
    namespaced,
    status = "DormantDatabaseStatus",
    printcolumn = r#"{"name":"WipeOut", "type":"boolean", "jsonPath":".spec.wipeOut"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DormantDatabaseSpec {
    pub origin: Origin,

    /// Armed only right before the record is deleted for good
    #[serde(default)]
    pub wipe_out: bool,
}

/// Deep copy of the paused resource
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    pub metadata: OriginMeta,
    pub spec: OriginSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct OriginMeta {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Origin spec keyed by database kind
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct OriginSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mongodb: Option<MongoDBSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DormantDatabaseStatus {
    #[serde(default)]
    pub phase: DormantPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wiped_out_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum DormantPhase {
    /// Workloads of the origin are still being torn down
    #[default]
    Pausing,
    /// The origin is fully paused
    Paused,
    /// Data of the origin was destroyed
    WipedOut,
}

impl std::fmt::Display for DormantPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DormantPhase::Pausing => write!(f, "Pausing"),
            DormantPhase::Paused => write!(f, "Paused"),
            DormantPhase::WipedOut => write!(f, "WipedOut"),
        }
    }
}

impl DormantDatabase {
    pub fn phase(&self) -> DormantPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Kind of the database the record was created from
    pub fn origin_kind(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(super::LABEL_KIND))
            .map(String::as_str)
    }
}
