//! ServiceMonitor of databases scraped through the Prometheus operator
//!
//! The monitor lives wherever Prometheus looks for monitors, usually not in
//! the database namespace, so it carries no owner reference. Its location is
//! recorded on the data service instead, and a monitor found at a recorded
//! location the spec no longer asks for is deleted.

use std::fmt;

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use tracing::info;

use crate::controller::error::Result;
use crate::crd::{
    AgentKind, MongoDB, MonitorEndpoint, MonitorSelector, NamespaceSelector, ServiceMonitor,
    ServiceMonitorSpec,
};
use crate::resources::common::standard_labels;
use crate::resources::workload::EXPORTER_PORT_NAME;
use crate::store::{Lookup, Propagation, Store, Verb, create_or_patch};

/// Data service annotation holding `<namespace>/<name>` of the monitor
pub const SERVICE_MONITOR_ANNOTATION: &str = "mongodb-operator.smoketurner.com/service-monitor";

/// Path the exporter serves metrics on
pub const METRICS_PATH: &str = "/metrics";

pub fn service_monitor_name(namespace: &str, name: &str) -> String {
    format!("mongodb-{}-{}", namespace, name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorLocation {
    pub namespace: String,
    pub name: String,
}

impl MonitorLocation {
    pub fn parse(value: &str) -> Option<Self> {
        let (namespace, name) = value.split_once('/')?;
        (!namespace.is_empty() && !name.is_empty()).then(|| Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for MonitorLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Where the monitor of a database belongs, if it should have one
pub fn desired_location(mongodb: &MongoDB) -> Option<MonitorLocation> {
    let monitor = mongodb.spec.monitor.as_ref()?;
    if monitor.agent != AgentKind::PrometheusOperator {
        return None;
    }
    let namespace = monitor
        .prometheus
        .as_ref()
        .and_then(|p| p.namespace.clone())
        .filter(|ns| !ns.is_empty())?;
    Some(MonitorLocation {
        namespace,
        name: service_monitor_name(&mongodb.namespace().unwrap_or_default(), &mongodb.name_any()),
    })
}

/// ServiceMonitor selecting the exporter port of the data service
pub fn service_monitor(mongodb: &MongoDB) -> Option<ServiceMonitor> {
    let location = desired_location(mongodb)?;
    let prometheus = mongodb.spec.monitor.as_ref()?.prometheus.as_ref()?;
    let name = mongodb.name_any();

    // Prometheus picks monitors up by these labels; ours win on a clash
    let mut labels = prometheus.labels.clone();
    labels.extend(standard_labels(&name));

    Some(ServiceMonitor {
        metadata: ObjectMeta {
            name: Some(location.name),
            namespace: Some(location.namespace),
            labels: Some(labels),
            ..Default::default()
        },
        spec: ServiceMonitorSpec {
            selector: MonitorSelector {
                match_labels: standard_labels(&name),
            },
            namespace_selector: Some(NamespaceSelector {
                match_names: mongodb.namespace().into_iter().collect(),
            }),
            endpoints: vec![MonitorEndpoint {
                port: EXPORTER_PORT_NAME.to_string(),
                path: Some(METRICS_PATH.to_string()),
                interval: prometheus.interval.clone(),
            }],
        },
    })
}

/// Note the monitor location on a data service about to be written
pub fn record_location(service: &mut Service, location: &MonitorLocation) {
    service
        .annotations_mut()
        .insert(SERVICE_MONITOR_ANNOTATION.to_string(), location.to_string());
}

/// Location noted on the live data service
async fn recorded_location(store: &Store, mongodb: &MongoDB) -> Result<Option<MonitorLocation>> {
    let namespace = mongodb.namespace().unwrap_or_default();
    Ok(match store.get::<Service>(&namespace, &mongodb.name_any()).await? {
        Lookup::Found(service) => service
            .annotations()
            .get(SERVICE_MONITOR_ANNOTATION)
            .and_then(|v| MonitorLocation::parse(v)),
        Lookup::NotFound => None,
    })
}

async fn delete_at(store: &Store, location: &MonitorLocation) -> Result<bool> {
    match store
        .delete::<ServiceMonitor>(&location.namespace, &location.name, Propagation::Background)
        .await?
    {
        Lookup::Found(()) => {
            info!(monitor = %location, "Removed ServiceMonitor");
            Ok(true)
        }
        Lookup::NotFound => Ok(false),
    }
}

/// Bring the ServiceMonitor in line with the declared agent.
///
/// A monitor left at a previously recorded location is deleted when the
/// agent changed, monitoring was switched off or the monitor moved. Returns
/// the location to record on the data service.
pub async fn sync_service_monitor(
    store: &Store,
    mongodb: &MongoDB,
) -> Result<(Verb, Option<MonitorLocation>)> {
    let location = desired_location(mongodb);
    if let Some(previous) = recorded_location(store, mongodb).await?
        && location.as_ref() != Some(&previous)
    {
        delete_at(store, &previous).await?;
    }

    let verb = match service_monitor(mongodb) {
        Some(monitor) => create_or_patch(store, &monitor).await?,
        None => Verb::Unchanged,
    };
    Ok((verb, location))
}

/// Delete the monitor at its recorded and its desired location
pub async fn remove_service_monitor(store: &Store, mongodb: &MongoDB) -> Result<bool> {
    let mut locations: Vec<MonitorLocation> = recorded_location(store, mongodb)
        .await?
        .into_iter()
        .collect();
    if let Some(desired) = desired_location(mongodb)
        && !locations.contains(&desired)
    {
        locations.push(desired);
    }

    let mut removed = false;
    for location in &locations {
        removed |= delete_at(store, location).await?;
    }
    Ok(removed)
}
