//! Security-list rule management
//!
//! Keeps the subnet security lists open for load-balancer traffic: listener
//! ingress on the balancer subnets, node-port egress toward the node subnets,
//! and node-port ingress on the node subnets when the All mode is active.
//! Rules authored here carry a reserved description so cleanup can remove
//! exactly what this operator added and nothing else.

use crate::client::types::{SecurityList, SecurityRule, Subnet};
use crate::client::{CallContext, CloudClient};
use crate::config::SecurityListManagementMode;
use crate::domain::{Protocol, ServiceSpec};
use crate::error::{Error, Result};
use tracing::{debug, info};

/// Description prefix marking rules owned by this operator
pub const RULE_DESCRIPTION_PREFIX: &str = "oci-cloud-operator:";

/// Attempts for one etag-guarded read-modify-write before giving up
const RMW_ATTEMPTS: u32 = 5;

/// Traffic open by default when the service restricts nothing
const OPEN_CIDR: &str = "0.0.0.0/0";

/// Description stamped on every rule for `svc`; keyed on the immutable uid so
/// renames do not orphan rules.
pub fn rule_description(svc: &ServiceSpec) -> String {
    format!("{}{}", RULE_DESCRIPTION_PREFIX, svc.uid)
}

fn protocol_number(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Tcp => "6",
        Protocol::Udp => "17",
    }
}

/// Health-check probes always travel TCP.
const TCP: &str = "6";

// =============================================================================
// Required Rules
// =============================================================================

/// Ingress needed on the balancer subnets: every allowed source CIDR to every
/// listener port.
fn lb_ingress_rules(svc: &ServiceSpec, description: &str) -> Vec<SecurityRule> {
    let sources: Vec<&str> = if svc.source_cidrs.is_empty() {
        vec![OPEN_CIDR]
    } else {
        svc.source_cidrs.iter().map(String::as_str).collect()
    };
    let mut rules = Vec::new();
    for port in &svc.ports {
        for cidr in &sources {
            rules.push(SecurityRule {
                description: Some(description.to_string()),
                cidr: cidr.to_string(),
                protocol: protocol_number(port.protocol).to_string(),
                port_min: port.external_port,
                port_max: port.external_port,
            });
        }
    }
    rules
}

/// Egress needed on the balancer subnets: node ports plus the health-check
/// port toward every node subnet.
fn lb_egress_rules(
    svc: &ServiceSpec,
    node_subnet_cidrs: &[String],
    health_check_port: u16,
    description: &str,
) -> Vec<SecurityRule> {
    let mut rules = Vec::new();
    for cidr in node_subnet_cidrs {
        for port in &svc.ports {
            rules.push(SecurityRule {
                description: Some(description.to_string()),
                cidr: cidr.clone(),
                protocol: protocol_number(port.protocol).to_string(),
                port_min: port.node_port,
                port_max: port.node_port,
            });
        }
        rules.push(SecurityRule {
            description: Some(description.to_string()),
            cidr: cidr.clone(),
            protocol: TCP.to_string(),
            port_min: health_check_port,
            port_max: health_check_port,
        });
    }
    rules
}

/// Ingress needed on the node subnets: the mirror of the balancer egress,
/// sourced from the balancer subnet CIDRs.
fn node_ingress_rules(
    svc: &ServiceSpec,
    lb_subnet_cidrs: &[String],
    health_check_port: u16,
    description: &str,
) -> Vec<SecurityRule> {
    let mut rules = Vec::new();
    for cidr in lb_subnet_cidrs {
        for port in &svc.ports {
            rules.push(SecurityRule {
                description: Some(description.to_string()),
                cidr: cidr.clone(),
                protocol: protocol_number(port.protocol).to_string(),
                port_min: port.node_port,
                port_max: port.node_port,
            });
        }
        rules.push(SecurityRule {
            description: Some(description.to_string()),
            cidr: cidr.clone(),
            protocol: TCP.to_string(),
            port_min: health_check_port,
            port_max: health_check_port,
        });
    }
    rules
}

// =============================================================================
// Manager
// =============================================================================

pub struct SecurityListManager {
    client: CloudClient,
    mode: SecurityListManagementMode,
}

impl SecurityListManager {
    pub fn new(client: CloudClient, mode: SecurityListManagementMode) -> Self {
        Self { client, mode }
    }

    pub fn mode(&self) -> SecurityListManagementMode {
        self.mode
    }

    /// Converge the security lists for one service.
    ///
    /// `health_check_port` is the port the balancer probes on every node.
    pub async fn reconcile(
        &self,
        ctx: &CallContext,
        svc: &ServiceSpec,
        lb_subnet_ids: &[String],
        node_subnet_ids: &[String],
        health_check_port: u16,
    ) -> Result<()> {
        if self.mode == SecurityListManagementMode::None {
            return Ok(());
        }
        let description = rule_description(svc);

        let lb_subnets = self.fetch_subnets(ctx, lb_subnet_ids).await?;
        let node_subnets = self.fetch_subnets(ctx, node_subnet_ids).await?;
        let lb_cidrs: Vec<String> = lb_subnets.iter().map(|s| s.cidr_block.clone()).collect();
        let node_cidrs: Vec<String> = node_subnets.iter().map(|s| s.cidr_block.clone()).collect();

        let ingress = lb_ingress_rules(svc, &description);
        let egress = lb_egress_rules(svc, &node_cidrs, health_check_port, &description);
        for subnet in &lb_subnets {
            if let Some(list_id) = subnet.security_list_ids.first() {
                self.converge_list(ctx, list_id, &description, &ingress, &egress)
                    .await?;
            }
        }

        if self.mode == SecurityListManagementMode::All {
            let node_ingress = node_ingress_rules(svc, &lb_cidrs, health_check_port, &description);
            for subnet in &node_subnets {
                if let Some(list_id) = subnet.security_list_ids.first() {
                    self.converge_list(ctx, list_id, &description, &node_ingress, &[])
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Remove every rule this operator authored for `svc` from the given
    /// subnets' security lists.
    pub async fn cleanup(
        &self,
        ctx: &CallContext,
        svc: &ServiceSpec,
        subnet_ids: &[String],
    ) -> Result<()> {
        if self.mode == SecurityListManagementMode::None {
            return Ok(());
        }
        let description = rule_description(svc);
        let subnets = self.fetch_subnets(ctx, subnet_ids).await?;
        for subnet in &subnets {
            if let Some(list_id) = subnet.security_list_ids.first() {
                self.converge_list(ctx, list_id, &description, &[], &[])
                    .await?;
            }
        }
        Ok(())
    }

    async fn fetch_subnets(&self, ctx: &CallContext, ids: &[String]) -> Result<Vec<Subnet>> {
        let mut subnets = Vec::with_capacity(ids.len());
        for id in ids {
            subnets.push(self.client.get_subnet(ctx, id).await?);
        }
        Ok(subnets)
    }

    /// Etag-guarded read-modify-write of one list: drop our stale rules, add
    /// the wanted ones, retry on concurrent writers.
    async fn converge_list(
        &self,
        ctx: &CallContext,
        list_id: &str,
        description: &str,
        want_ingress: &[SecurityRule],
        want_egress: &[SecurityRule],
    ) -> Result<()> {
        for attempt in 0..RMW_ATTEMPTS {
            let list = self.client.get_security_list(ctx, list_id).await?;
            let ingress = merged_rules(&list.ingress_rules, want_ingress, description);
            let egress = merged_rules(&list.egress_rules, want_egress, description);
            if ingress == list.ingress_rules && egress == list.egress_rules {
                debug!(list_id, "security list already converged");
                return Ok(());
            }
            match self
                .client
                .update_security_list(ctx, list_id, &list.etag, ingress, egress)
                .await
            {
                Ok(_) => {
                    info!(list_id, "security list updated");
                    return Ok(());
                }
                Err(Error::Conflict { .. }) if attempt + 1 < RMW_ATTEMPTS => {
                    debug!(list_id, attempt, "security list etag moved, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict {
            message: format!("security list {} kept moving", list_id),
        })
    }
}

/// Existing rules minus ours, plus the wanted set, deduplicated and in
/// deterministic order. Foreign rules are never touched.
fn merged_rules(
    existing: &[SecurityRule],
    wanted: &[SecurityRule],
    description: &str,
) -> Vec<SecurityRule> {
    let mut merged: Vec<SecurityRule> = existing
        .iter()
        .filter(|r| r.description.as_deref() != Some(description))
        .cloned()
        .collect();
    merged.extend_from_slice(wanted);
    merged.sort();
    merged.dedup();
    merged
}

/// Whether a rule set still references the given service description.
pub fn has_rules_for(list: &SecurityList, description: &str) -> bool {
    list.ingress_rules
        .iter()
        .chain(list.egress_rules.iter())
        .any(|r| r.description.as_deref() == Some(description))
}
