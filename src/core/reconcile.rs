//! Idempotent reconciliation of the live filter state
//!
//! [`Reconciler::ensure_baseline`] creates whatever part of the table / chain /
//! set / rule skeleton is missing. [`Reconciler::sync_service`] then adds one
//! port to its protocol's set if it is not already listed. Both only ever add:
//! elements are removed solely through [`Reconciler::remove_service`].
//!
//! Running either operation against a state that already matches the policy
//! issues no mutating command.

use crate::audit::{AuditLog, EventType};
use crate::core::error::{Error, Result};
use crate::core::gateway::FilterGateway;
use crate::core::inspect::{LiveStateInspector, listing_contains};
use crate::core::nft::NftRunner;
use crate::core::objects::{
    ChainPolicy, INPUT_CHAIN, SetSpec, baseline_chains, set_accept_needle, set_accept_rule,
};
use crate::core::service::{DesiredPolicy, Protocol, Service};
use crate::notify::Notifier;
use strum::IntoEnumIterator;
use tracing::{debug, info, warn};

/// What a reconciliation step did (or would do, in dry-run mode)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Added,
    Removed,
    Unchanged,
    WouldAdd,
    WouldRemove,
}

impl Outcome {
    /// `true` when live state was modified
    pub fn changed(self) -> bool {
        matches!(self, Outcome::Added | Outcome::Removed)
    }
}

/// A per-service failure, carrying the service for reporting
#[derive(Debug, thiserror::Error)]
#[error("{service}: {source}")]
pub struct ServiceError {
    pub service: Service,
    #[source]
    pub source: Error,
}

/// Objects created (or that would be created) by one baseline pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaselineReport {
    pub created: Vec<String>,
}

impl BaselineReport {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty()
    }
}

/// Outcome of every service in a batch, in policy order
#[derive(Debug, Default)]
pub struct SyncReport {
    pub results: Vec<(Service, std::result::Result<Outcome, ServiceError>)>,
}

impl SyncReport {
    pub fn changed(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, r)| r.as_ref().is_ok_and(|o| o.changed()))
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ServiceError> {
        self.results.iter().filter_map(|(_, r)| r.as_ref().err())
    }

    pub fn failed(&self) -> usize {
        self.failures().count()
    }
}

/// Differences between the live state and the desired policy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriftReport {
    pub missing_objects: Vec<String>,
    pub missing_services: Vec<Service>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.missing_objects.is_empty() && self.missing_services.is_empty()
    }
}

pub struct Reconciler<'a, R> {
    gateway: &'a FilterGateway<R>,
    notifier: &'a dyn Notifier,
    audit: Option<&'a AuditLog>,
    dry_run: bool,
}

impl<'a, R: NftRunner + Sync> Reconciler<'a, R> {
    pub fn new(gateway: &'a FilterGateway<R>, notifier: &'a dyn Notifier) -> Self {
        Self {
            gateway,
            notifier,
            audit: None,
            dry_run: false,
        }
    }

    pub fn with_audit(mut self, audit: &'a AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    fn inspector(&self) -> LiveStateInspector<'a, R> {
        LiveStateInspector::new(self.gateway)
    }

    async fn audit(
        &self,
        event: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) {
        if self.dry_run {
            return;
        }
        if let Some(audit) = self.audit {
            audit.record(event, success, details, error).await;
        }
    }

    /// Creates any missing part of the baseline.
    ///
    /// Order: table, the three base chains (input, forward, output), the tcp
    /// and udp sets, then the set-accept rules in the input chain. Sets created
    /// here are seeded with `seed`'s ports for their protocol.
    ///
    /// The input chain is listed once for the rule step; if that listing fails
    /// no rule is added.
    ///
    /// # Errors
    ///
    /// Returns the first mutate failure; later steps are not attempted since
    /// they depend on the earlier objects.
    pub async fn ensure_baseline(
        &self,
        input_policy: ChainPolicy,
        seed: &DesiredPolicy,
    ) -> Result<BaselineReport> {
        let result = self.ensure_baseline_inner(input_policy, seed).await;

        match &result {
            Ok(report) if !report.is_noop() => {
                info!("Baseline created: {}", report.created.join(", "));
                self.audit(
                    EventType::EnsureBaseline,
                    true,
                    serde_json::json!({ "created": report.created }),
                    None,
                )
                .await;
            }
            Ok(_) => debug!("Baseline already present"),
            Err(e) => {
                self.audit(
                    EventType::EnsureBaseline,
                    false,
                    serde_json::json!({}),
                    Some(e.to_string()),
                )
                .await;
            }
        }
        result
    }

    async fn ensure_baseline_inner(
        &self,
        input_policy: ChainPolicy,
        seed: &DesiredPolicy,
    ) -> Result<BaselineReport> {
        let inspector = self.inspector();
        let mut report = BaselineReport::default();

        if !inspector.table_exists().await {
            if !self.dry_run {
                self.gateway.add_table().await?;
            }
            report.created.push(format!("table {}", self.gateway.table()));
        }

        for chain in baseline_chains(input_policy) {
            if inspector.chain_exists(chain.name).await {
                continue;
            }
            if !self.dry_run {
                self.gateway.add_chain(&chain).await?;
            }
            report.created.push(format!("chain {}", chain.name));
        }

        for protocol in Protocol::iter() {
            let set = SetSpec::for_protocol(protocol);
            if inspector.set_exists(set.name).await {
                continue;
            }
            if !self.dry_run {
                self.gateway.add_set(&set, &seed.ports(protocol)).await?;
            }
            report.created.push(format!("set {}", set.name));
        }

        let Some(listing) = self.gateway.list_chain(INPUT_CHAIN).await else {
            if self.dry_run {
                // The chain would have been created above, so both rules would follow it
                for protocol in Protocol::iter() {
                    report.created.push(format!("rule {}", set_accept_needle(protocol)));
                }
            } else {
                warn!("Could not list chain {INPUT_CHAIN}, skipping set rules");
            }
            return Ok(report);
        };

        for protocol in Protocol::iter() {
            let needle = set_accept_needle(protocol);
            if listing_contains(&listing, &needle) {
                continue;
            }
            if !self.dry_run {
                self.gateway
                    .add_rule(INPUT_CHAIN, &set_accept_rule(protocol))
                    .await?;
            }
            report.created.push(format!("rule {needle}"));
        }

        Ok(report)
    }

    /// Adds `service.port` to its protocol's set unless already listed.
    ///
    /// Notification is left to the caller: `Outcome::Added` versus
    /// `Outcome::Unchanged` lets it report only real changes.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] naming the service if the add fails.
    pub async fn sync_service(
        &self,
        service: &Service,
    ) -> std::result::Result<Outcome, ServiceError> {
        let set = service.protocol.set_name();

        if self.inspector().element_present(set, service.port).await {
            debug!("{service} already in @{set}");
            return Ok(Outcome::Unchanged);
        }

        if self.dry_run {
            info!("[dry run] would add {service} to @{set}");
            return Ok(Outcome::WouldAdd);
        }

        let details = serde_json::json!({
            "name": service.name,
            "port": service.port,
            "protocol": service.protocol,
            "set": set,
        });

        match self.gateway.add_element(set, service.port).await {
            Ok(()) => {
                info!("Added {service} to @{set}");
                self.audit(EventType::ElementAdded, true, details, None).await;
                Ok(Outcome::Added)
            }
            Err(source) => {
                warn!("Failed to add {service} to @{set}: {source}");
                self.audit(
                    EventType::ElementAddFailed,
                    false,
                    details,
                    Some(source.to_string()),
                )
                .await;
                Err(ServiceError {
                    service: service.clone(),
                    source,
                })
            }
        }
    }

    /// Syncs every service independently and notifies for each change or failure.
    ///
    /// A failing service never stops or rolls back the others.
    pub async fn sync_all(&self, policy: &DesiredPolicy) -> SyncReport {
        let mut report = SyncReport::default();

        for service in policy.services() {
            let result = self.sync_service(service).await;
            match &result {
                Ok(Outcome::Added) => self.notifier.notify(&format!(
                    "added {service} to @{}",
                    service.protocol.set_name()
                )),
                Err(e) => self
                    .notifier
                    .notify(&format!("failed to add {service}: {}", e.source)),
                Ok(_) => {}
            }
            report.results.push((service.clone(), result));
        }

        info!(
            "Synced {} service(s): {} changed, {} failed",
            report.results.len(),
            report.changed(),
            report.failed()
        );
        report
    }

    /// Removes `service.port` from its set if listed.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] if the delete fails.
    pub async fn remove_service(
        &self,
        service: &Service,
    ) -> std::result::Result<Outcome, ServiceError> {
        let set = service.protocol.set_name();

        if !self.inspector().element_present(set, service.port).await {
            debug!("{service} not in @{set}, nothing to remove");
            return Ok(Outcome::Unchanged);
        }

        if self.dry_run {
            info!("[dry run] would remove {service} from @{set}");
            return Ok(Outcome::WouldRemove);
        }

        match self.gateway.delete_element(set, service.port).await {
            Ok(()) => {
                info!("Removed {service} from @{set}");
                self.audit(
                    EventType::ElementRemoved,
                    true,
                    serde_json::json!({ "port": service.port, "protocol": service.protocol }),
                    None,
                )
                .await;
                self.notifier
                    .notify(&format!("removed {service} from @{set}"));
                Ok(Outcome::Removed)
            }
            Err(source) => Err(ServiceError {
                service: service.clone(),
                source,
            }),
        }
    }

    /// Reports baseline objects and services missing from the live state.
    ///
    /// Never mutates. Each missing service is also sent to the notifier.
    pub async fn check(&self, input_policy: ChainPolicy, policy: &DesiredPolicy) -> DriftReport {
        let inspector = self.inspector();
        let mut report = DriftReport::default();

        if !inspector.table_exists().await {
            report
                .missing_objects
                .push(format!("table {}", self.gateway.table()));
        }
        for chain in baseline_chains(input_policy) {
            if !inspector.chain_exists(chain.name).await {
                report.missing_objects.push(format!("chain {}", chain.name));
            }
        }
        for protocol in Protocol::iter() {
            let set = protocol.set_name();
            if !inspector.set_exists(set).await {
                report.missing_objects.push(format!("set {set}"));
            }
            let needle = set_accept_needle(protocol);
            if !inspector.rule_present(INPUT_CHAIN, &needle).await {
                report.missing_objects.push(format!("rule {needle}"));
            }
        }

        for service in policy.services() {
            let set = service.protocol.set_name();
            if !inspector.element_present(set, service.port).await {
                self.notifier
                    .notify(&format!("missing {service} in @{set}"));
                report.missing_services.push(service.clone());
            }
        }

        if !report.is_clean() {
            self.audit(
                EventType::DriftDetected,
                false,
                serde_json::json!({
                    "missing_objects": report.missing_objects,
                    "missing_services": report.missing_services,
                }),
                None,
            )
            .await;
        }
        report
    }
}
