//! In-memory cloud for tests and standalone runs
//!
//! [`FakeCloud`] implements the full [`CloudApi`] surface over process-local
//! state. Mutations are applied synchronously and every asynchronous
//! operation completes with an already-succeeded work request. Tests can seed
//! resources, inject failures per operation and inspect the call log.

use super::api::*;
use super::types::*;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use reqwest::StatusCode;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct Inner {
    next_id: u64,
    load_balancers: BTreeMap<String, LoadBalancer>,
    volumes: BTreeMap<String, Volume>,
    attachments: BTreeMap<String, VolumeAttachment>,
    subnets: BTreeMap<String, Subnet>,
    security_lists: BTreeMap<String, SecurityList>,
    instances: BTreeMap<String, Instance>,
    vnic_attachments: BTreeMap<String, VnicAttachment>,
    vnics: BTreeMap<String, Vnic>,
    availability_domains: Vec<AvailabilityDomain>,
    work_requests: BTreeMap<String, WorkRequest>,
    /// client token -> volume id, for create collapsing
    volume_tokens: HashMap<String, String>,
}

/// One injected failure schedule: error to return, attempts remaining.
struct Injection {
    error: CloudError,
    remaining: u32,
}

pub struct FakeCloud {
    compartment_id: String,
    inner: RwLock<Inner>,
    injections: Mutex<HashMap<String, Injection>>,
    call_log: Mutex<Vec<String>>,
}

impl FakeCloud {
    pub fn new(compartment_id: &str) -> Self {
        let fake = Self {
            compartment_id: compartment_id.to_string(),
            inner: RwLock::new(Inner::default()),
            injections: Mutex::new(HashMap::new()),
            call_log: Mutex::new(Vec::new()),
        };
        fake.inner.write().availability_domains = vec![
            AvailabilityDomain { name: "AD-1".into() },
            AvailabilityDomain { name: "AD-2".into() },
        ];
        fake
    }

    fn ocid(inner: &mut Inner, kind: &str) -> String {
        inner.next_id += 1;
        format!("ocid1.{}.oc1..{:04}", kind, inner.next_id)
    }

    /// Record the call and pop an injected failure if one is scheduled.
    fn enter(&self, op: &str) -> ApiResult<()> {
        self.call_log.lock().push(op.to_string());
        let mut injections = self.injections.lock();
        if let Some(inj) = injections.get_mut(op) {
            if inj.remaining > 0 {
                inj.remaining -= 1;
                return Err(inj.error.clone());
            }
        }
        Ok(())
    }

    // =========================================================================
    // Test Hooks
    // =========================================================================

    /// Make the next `times` invocations of `op` fail with `error`.
    pub fn fail_times(&self, op: &str, error: CloudError, times: u32) {
        self.injections.lock().insert(
            op.to_string(),
            Injection {
                error,
                remaining: times,
            },
        );
    }

    /// How many times `op` was invoked.
    pub fn calls_for(&self, op: &str) -> usize {
        self.call_log.lock().iter().filter(|c| *c == op).count()
    }

    /// Total invocations across all operations.
    pub fn total_calls(&self) -> usize {
        self.call_log.lock().len()
    }

    pub fn clear_call_log(&self) {
        self.call_log.lock().clear();
    }

    pub fn volume_count(&self) -> usize {
        self.inner.read().volumes.len()
    }

    pub fn lb_by_name(&self, name: &str) -> Option<LoadBalancer> {
        self.inner
            .read()
            .load_balancers
            .values()
            .find(|lb| lb.display_name == name)
            .cloned()
    }

    pub fn get_volume_state(&self, id: &str) -> Option<VolumeState> {
        self.inner.read().volumes.get(id).map(|v| v.lifecycle_state)
    }

    pub fn set_lb_state(&self, id: &str, state: LbLifecycleState) {
        if let Some(lb) = self.inner.write().load_balancers.get_mut(id) {
            lb.lifecycle_state = state;
        }
    }

    pub fn set_volume_state(&self, id: &str, state: VolumeState) {
        if let Some(v) = self.inner.write().volumes.get_mut(id) {
            v.lifecycle_state = state;
        }
    }

    pub fn set_volume_created_at(&self, id: &str, at: chrono::DateTime<chrono::Utc>) {
        if let Some(v) = self.inner.write().volumes.get_mut(id) {
            v.time_created = at;
        }
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    pub fn seed_availability_domains(&self, names: &[&str]) {
        self.inner.write().availability_domains = names
            .iter()
            .map(|n| AvailabilityDomain {
                name: n.to_string(),
            })
            .collect();
    }

    pub fn seed_volume(
        &self,
        display_name: &str,
        availability_domain: &str,
        size_mbs: u64,
        freeform_tags: BTreeMap<String, String>,
    ) -> String {
        let mut inner = self.inner.write();
        let id = Self::ocid(&mut inner, "volume");
        inner.volumes.insert(
            id.clone(),
            Volume {
                id: id.clone(),
                display_name: display_name.to_string(),
                compartment_id: self.compartment_id.clone(),
                availability_domain: availability_domain.to_string(),
                size_mbs,
                lifecycle_state: VolumeState::Available,
                kms_key_id: None,
                vpus_per_gb: None,
                source_snapshot_id: None,
                freeform_tags,
                defined_tags: BTreeMap::new(),
                time_created: chrono::Utc::now(),
            },
        );
        id
    }

    pub fn seed_subnet(&self, availability_domain: Option<&str>, cidr_block: &str) -> String {
        let mut inner = self.inner.write();
        let id = Self::ocid(&mut inner, "subnet");
        inner.subnets.insert(
            id.clone(),
            Subnet {
                id: id.clone(),
                vcn_id: "ocid1.vcn.oc1..vcn".into(),
                cidr_block: cidr_block.to_string(),
                availability_domain: availability_domain.map(str::to_string),
                security_list_ids: Vec::new(),
            },
        );
        id
    }

    /// Create an empty security list and attach it to `subnet_id` when the
    /// subnet is known.
    pub fn seed_security_list(&self, subnet_id: &str) -> String {
        let mut inner = self.inner.write();
        let id = Self::ocid(&mut inner, "securitylist");
        inner.security_lists.insert(
            id.clone(),
            SecurityList {
                id: id.clone(),
                display_name: format!("seclist for {}", subnet_id),
                etag: "etag-1".into(),
                ingress_rules: Vec::new(),
                egress_rules: Vec::new(),
            },
        );
        if let Some(subnet) = inner.subnets.get_mut(subnet_id) {
            subnet.security_list_ids.push(id.clone());
        }
        id
    }

    pub fn seed_instance(&self, display_name: &str, availability_domain: &str) -> String {
        let mut inner = self.inner.write();
        let id = Self::ocid(&mut inner, "instance");
        inner.instances.insert(
            id.clone(),
            Instance {
                id: id.clone(),
                display_name: display_name.to_string(),
                compartment_id: self.compartment_id.clone(),
                availability_domain: availability_domain.to_string(),
                lifecycle_state: "RUNNING".into(),
            },
        );
        id
    }

    pub fn sample_lb_details(&self, display_name: &str) -> CreateLoadBalancerDetails {
        CreateLoadBalancerDetails {
            display_name: display_name.to_string(),
            compartment_id: self.compartment_id.clone(),
            shape: "flexible".into(),
            shape_min_mbps: Some(10),
            shape_max_mbps: Some(100),
            subnet_ids: vec!["ocid1.subnet.oc1..s1".into(), "ocid1.subnet.oc1..s2".into()],
            is_private: false,
            listeners: BTreeMap::new(),
            backend_sets: BTreeMap::new(),
            certificates: BTreeMap::new(),
            nsg_ids: Vec::new(),
            freeform_tags: BTreeMap::new(),
            defined_tags: BTreeMap::new(),
        }
    }

    pub fn sample_volume_details(
        &self,
        display_name: &str,
        availability_domain: &str,
    ) -> CreateVolumeDetails {
        CreateVolumeDetails {
            display_name: display_name.to_string(),
            compartment_id: self.compartment_id.clone(),
            availability_domain: availability_domain.to_string(),
            size_mbs: 50 * 1024,
            kms_key_id: None,
            vpus_per_gb: Some(10),
            source_snapshot_id: None,
            freeform_tags: BTreeMap::new(),
            defined_tags: BTreeMap::new(),
        }
    }

    fn succeeded_work_request(inner: &mut Inner) -> String {
        let id = Self::ocid(inner, "workrequest");
        inner.work_requests.insert(
            id.clone(),
            WorkRequest {
                id: id.clone(),
                lifecycle_state: WorkRequestState::Succeeded,
                message: None,
            },
        );
        id
    }
}

// =============================================================================
// Trait Implementations
// =============================================================================

#[async_trait]
impl ComputeApi for FakeCloud {
    async fn get_instance(&self, _ctx: &CallContext, id: &str) -> ApiResult<Instance> {
        self.enter("get_instance")?;
        self.inner
            .read()
            .instances
            .get(id)
            .cloned()
            .ok_or_else(|| CloudError::not_found(format!("instance {}", id)))
    }

    async fn list_vnic_attachments(
        &self,
        _ctx: &CallContext,
        _compartment_id: &str,
        instance_id: &str,
    ) -> ApiResult<Vec<VnicAttachment>> {
        self.enter("list_vnic_attachments")?;
        Ok(self
            .inner
            .read()
            .vnic_attachments
            .values()
            .filter(|va| va.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn get_vnic(&self, _ctx: &CallContext, id: &str) -> ApiResult<Vnic> {
        self.enter("get_vnic")?;
        self.inner
            .read()
            .vnics
            .get(id)
            .cloned()
            .ok_or_else(|| CloudError::not_found(format!("vnic {}", id)))
    }
}

#[async_trait]
impl NetworkingApi for FakeCloud {
    async fn get_subnet(&self, _ctx: &CallContext, id: &str) -> ApiResult<Subnet> {
        self.enter("get_subnet")?;
        self.inner
            .read()
            .subnets
            .get(id)
            .cloned()
            .ok_or_else(|| CloudError::not_found(format!("subnet {}", id)))
    }

    async fn get_security_list(&self, _ctx: &CallContext, id: &str) -> ApiResult<SecurityList> {
        self.enter("get_security_list")?;
        self.inner
            .read()
            .security_lists
            .get(id)
            .cloned()
            .ok_or_else(|| CloudError::not_found(format!("security list {}", id)))
    }

    async fn update_security_list(
        &self,
        _ctx: &CallContext,
        id: &str,
        if_match: &str,
        ingress: Vec<SecurityRule>,
        egress: Vec<SecurityRule>,
    ) -> ApiResult<SecurityList> {
        self.enter("update_security_list")?;
        let mut inner = self.inner.write();
        inner.next_id += 1;
        let new_etag = format!("etag-{}", inner.next_id);
        let sl = inner
            .security_lists
            .get_mut(id)
            .ok_or_else(|| CloudError::not_found(format!("security list {}", id)))?;
        if sl.etag != if_match {
            return Err(CloudError::precondition_failed(format!(
                "etag {} does not match {}",
                if_match, sl.etag
            )));
        }
        sl.ingress_rules = ingress;
        sl.egress_rules = egress;
        sl.etag = new_etag;
        Ok(sl.clone())
    }
}

#[async_trait]
impl BlockStorageApi for FakeCloud {
    async fn create_volume(
        &self,
        _ctx: &CallContext,
        details: &CreateVolumeDetails,
        client_token: &str,
    ) -> ApiResult<Volume> {
        self.enter("create_volume")?;
        let mut inner = self.inner.write();
        if let Some(existing) = inner.volume_tokens.get(client_token) {
            let existing = existing.clone();
            if let Some(v) = inner.volumes.get(&existing) {
                return Ok(v.clone());
            }
        }
        let id = Self::ocid(&mut inner, "volume");
        let volume = Volume {
            id: id.clone(),
            display_name: details.display_name.clone(),
            compartment_id: details.compartment_id.clone(),
            availability_domain: details.availability_domain.clone(),
            size_mbs: details.size_mbs,
            lifecycle_state: VolumeState::Available,
            kms_key_id: details.kms_key_id.clone(),
            vpus_per_gb: details.vpus_per_gb,
            source_snapshot_id: details.source_snapshot_id.clone(),
            freeform_tags: details.freeform_tags.clone(),
            defined_tags: details.defined_tags.clone(),
            time_created: chrono::Utc::now(),
        };
        inner.volumes.insert(id.clone(), volume.clone());
        inner
            .volume_tokens
            .insert(client_token.to_string(), id);
        Ok(volume)
    }

    async fn get_volume(&self, _ctx: &CallContext, id: &str) -> ApiResult<Volume> {
        self.enter("get_volume")?;
        self.inner
            .read()
            .volumes
            .get(id)
            .cloned()
            .ok_or_else(|| CloudError::not_found(format!("volume {}", id)))
    }

    async fn list_volumes(
        &self,
        _ctx: &CallContext,
        compartment_id: &str,
    ) -> ApiResult<Vec<Volume>> {
        self.enter("list_volumes")?;
        Ok(self
            .inner
            .read()
            .volumes
            .values()
            .filter(|v| v.compartment_id == compartment_id)
            .cloned()
            .collect())
    }

    async fn delete_volume(&self, _ctx: &CallContext, id: &str) -> ApiResult<()> {
        self.enter("delete_volume")?;
        let mut inner = self.inner.write();
        match inner.volumes.get_mut(id) {
            Some(v) => {
                v.lifecycle_state = VolumeState::Terminated;
                Ok(())
            }
            None => Err(CloudError::not_found(format!("volume {}", id))),
        }
    }

    async fn attach_volume(
        &self,
        _ctx: &CallContext,
        details: &AttachVolumeDetails,
    ) -> ApiResult<VolumeAttachment> {
        self.enter("attach_volume")?;
        let mut inner = self.inner.write();
        if !inner.volumes.contains_key(&details.volume_id) {
            return Err(CloudError::not_found(format!(
                "volume {}",
                details.volume_id
            )));
        }
        let id = Self::ocid(&mut inner, "volumeattachment");
        let attachment = match details.attachment_type {
            AttachmentType::Iscsi => VolumeAttachment {
                id: id.clone(),
                volume_id: details.volume_id.clone(),
                instance_id: details.instance_id.clone(),
                attachment_type: AttachmentType::Iscsi,
                lifecycle_state: AttachmentState::Attached,
                iqn: Some(format!("iqn.2015-12.com.oracleiaas:{}", id)),
                ipv4: Some("169.254.2.2".into()),
                port: Some(3260),
                chap_username: None,
                chap_secret: None,
                is_multipath: false,
                device: None,
            },
            AttachmentType::Paravirtualized => VolumeAttachment {
                id: id.clone(),
                volume_id: details.volume_id.clone(),
                instance_id: details.instance_id.clone(),
                attachment_type: AttachmentType::Paravirtualized,
                lifecycle_state: AttachmentState::Attached,
                iqn: None,
                ipv4: None,
                port: None,
                chap_username: None,
                chap_secret: None,
                is_multipath: false,
                device: Some(format!("/dev/oracleoci/oraclevd{}", inner.next_id)),
            },
        };
        inner.attachments.insert(id, attachment.clone());
        Ok(attachment)
    }

    async fn get_volume_attachment(
        &self,
        _ctx: &CallContext,
        id: &str,
    ) -> ApiResult<VolumeAttachment> {
        self.enter("get_volume_attachment")?;
        self.inner
            .read()
            .attachments
            .get(id)
            .cloned()
            .ok_or_else(|| CloudError::not_found(format!("volume attachment {}", id)))
    }

    async fn list_volume_attachments(
        &self,
        _ctx: &CallContext,
        _compartment_id: &str,
        volume_id: &str,
    ) -> ApiResult<Vec<VolumeAttachment>> {
        self.enter("list_volume_attachments")?;
        Ok(self
            .inner
            .read()
            .attachments
            .values()
            .filter(|a| a.volume_id == volume_id)
            .cloned()
            .collect())
    }

    async fn detach_volume(&self, _ctx: &CallContext, attachment_id: &str) -> ApiResult<()> {
        self.enter("detach_volume")?;
        let mut inner = self.inner.write();
        match inner.attachments.get_mut(attachment_id) {
            Some(a) => {
                a.lifecycle_state = AttachmentState::Detached;
                Ok(())
            }
            None => Err(CloudError::not_found(format!(
                "volume attachment {}",
                attachment_id
            ))),
        }
    }
}

#[async_trait]
impl LoadBalancerApi for FakeCloud {
    async fn list_load_balancers(
        &self,
        _ctx: &CallContext,
        compartment_id: &str,
    ) -> ApiResult<Vec<LoadBalancer>> {
        self.enter("list_load_balancers")?;
        Ok(self
            .inner
            .read()
            .load_balancers
            .values()
            .filter(|lb| lb.compartment_id == compartment_id)
            .cloned()
            .collect())
    }

    async fn get_load_balancer(&self, _ctx: &CallContext, id: &str) -> ApiResult<LoadBalancer> {
        self.enter("get_load_balancer")?;
        self.inner
            .read()
            .load_balancers
            .get(id)
            .cloned()
            .ok_or_else(|| CloudError::not_found(format!("load balancer {}", id)))
    }

    async fn create_load_balancer(
        &self,
        _ctx: &CallContext,
        details: &CreateLoadBalancerDetails,
    ) -> ApiResult<String> {
        self.enter("create_load_balancer")?;
        let mut inner = self.inner.write();
        if inner
            .load_balancers
            .values()
            .any(|lb| lb.display_name == details.display_name)
        {
            return Err(CloudError::http(
                StatusCode::CONFLICT,
                Some("AlreadyExists"),
                format!("load balancer {} exists", details.display_name),
            ));
        }
        let id = Self::ocid(&mut inner, "loadbalancer");
        let ip = if details.is_private {
            IpAddress {
                ip_address: "10.0.1.10".into(),
                is_public: false,
            }
        } else {
            IpAddress {
                ip_address: "203.0.113.10".into(),
                is_public: true,
            }
        };
        inner.load_balancers.insert(
            id.clone(),
            LoadBalancer {
                id: id.clone(),
                display_name: details.display_name.clone(),
                compartment_id: details.compartment_id.clone(),
                lifecycle_state: LbLifecycleState::Active,
                shape: details.shape.clone(),
                shape_min_mbps: details.shape_min_mbps,
                shape_max_mbps: details.shape_max_mbps,
                subnet_ids: details.subnet_ids.clone(),
                is_private: details.is_private,
                listeners: details.listeners.clone(),
                backend_sets: details.backend_sets.clone(),
                certificates: details.certificates.clone(),
                ip_addresses: vec![ip],
                nsg_ids: details.nsg_ids.clone(),
                freeform_tags: details.freeform_tags.clone(),
                defined_tags: details.defined_tags.clone(),
                etag: Some("etag-1".into()),
            },
        );
        Ok(Self::succeeded_work_request(&mut inner))
    }

    async fn delete_load_balancer(&self, _ctx: &CallContext, id: &str) -> ApiResult<String> {
        self.enter("delete_load_balancer")?;
        let mut inner = self.inner.write();
        if inner.load_balancers.remove(id).is_none() {
            return Err(CloudError::not_found(format!("load balancer {}", id)));
        }
        Ok(Self::succeeded_work_request(&mut inner))
    }

    async fn create_backend_set(
        &self,
        _ctx: &CallContext,
        lb_id: &str,
        name: &str,
        spec: &BackendSet,
    ) -> ApiResult<String> {
        self.enter("create_backend_set")?;
        let mut inner = self.inner.write();
        let lb = inner
            .load_balancers
            .get_mut(lb_id)
            .ok_or_else(|| CloudError::not_found(format!("load balancer {}", lb_id)))?;
        if lb.backend_sets.contains_key(name) {
            return Err(CloudError::http(
                StatusCode::CONFLICT,
                Some("AlreadyExists"),
                format!("backend set {} exists", name),
            ));
        }
        lb.backend_sets.insert(name.to_string(), spec.clone());
        Ok(Self::succeeded_work_request(&mut inner))
    }

    async fn update_backend_set(
        &self,
        _ctx: &CallContext,
        lb_id: &str,
        name: &str,
        spec: &BackendSet,
    ) -> ApiResult<String> {
        self.enter("update_backend_set")?;
        let mut inner = self.inner.write();
        let lb = inner
            .load_balancers
            .get_mut(lb_id)
            .ok_or_else(|| CloudError::not_found(format!("load balancer {}", lb_id)))?;
        if !lb.backend_sets.contains_key(name) {
            return Err(CloudError::not_found(format!("backend set {}", name)));
        }
        lb.backend_sets.insert(name.to_string(), spec.clone());
        Ok(Self::succeeded_work_request(&mut inner))
    }

    async fn delete_backend_set(
        &self,
        _ctx: &CallContext,
        lb_id: &str,
        name: &str,
    ) -> ApiResult<String> {
        self.enter("delete_backend_set")?;
        let mut inner = self.inner.write();
        let lb = inner
            .load_balancers
            .get_mut(lb_id)
            .ok_or_else(|| CloudError::not_found(format!("load balancer {}", lb_id)))?;
        if lb.backend_sets.remove(name).is_none() {
            return Err(CloudError::not_found(format!("backend set {}", name)));
        }
        Ok(Self::succeeded_work_request(&mut inner))
    }

    async fn create_listener(
        &self,
        _ctx: &CallContext,
        lb_id: &str,
        name: &str,
        spec: &Listener,
    ) -> ApiResult<String> {
        self.enter("create_listener")?;
        let mut inner = self.inner.write();
        let lb = inner
            .load_balancers
            .get_mut(lb_id)
            .ok_or_else(|| CloudError::not_found(format!("load balancer {}", lb_id)))?;
        if lb.listeners.contains_key(name) {
            return Err(CloudError::http(
                StatusCode::CONFLICT,
                Some("AlreadyExists"),
                format!("listener {} exists", name),
            ));
        }
        lb.listeners.insert(name.to_string(), spec.clone());
        Ok(Self::succeeded_work_request(&mut inner))
    }

    async fn update_listener(
        &self,
        _ctx: &CallContext,
        lb_id: &str,
        name: &str,
        spec: &Listener,
    ) -> ApiResult<String> {
        self.enter("update_listener")?;
        let mut inner = self.inner.write();
        let lb = inner
            .load_balancers
            .get_mut(lb_id)
            .ok_or_else(|| CloudError::not_found(format!("load balancer {}", lb_id)))?;
        if !lb.listeners.contains_key(name) {
            return Err(CloudError::not_found(format!("listener {}", name)));
        }
        lb.listeners.insert(name.to_string(), spec.clone());
        Ok(Self::succeeded_work_request(&mut inner))
    }

    async fn delete_listener(
        &self,
        _ctx: &CallContext,
        lb_id: &str,
        name: &str,
    ) -> ApiResult<String> {
        self.enter("delete_listener")?;
        let mut inner = self.inner.write();
        let lb = inner
            .load_balancers
            .get_mut(lb_id)
            .ok_or_else(|| CloudError::not_found(format!("load balancer {}", lb_id)))?;
        if lb.listeners.remove(name).is_none() {
            return Err(CloudError::not_found(format!("listener {}", name)));
        }
        Ok(Self::succeeded_work_request(&mut inner))
    }

    async fn create_certificate(
        &self,
        _ctx: &CallContext,
        lb_id: &str,
        cert: &Certificate,
    ) -> ApiResult<String> {
        self.enter("create_certificate")?;
        let mut inner = self.inner.write();
        let lb = inner
            .load_balancers
            .get_mut(lb_id)
            .ok_or_else(|| CloudError::not_found(format!("load balancer {}", lb_id)))?;
        if lb.certificates.contains_key(&cert.certificate_name) {
            return Err(CloudError::http(
                StatusCode::CONFLICT,
                Some("AlreadyExists"),
                format!("certificate {} exists", cert.certificate_name),
            ));
        }
        lb.certificates
            .insert(cert.certificate_name.clone(), cert.clone());
        Ok(Self::succeeded_work_request(&mut inner))
    }

    async fn delete_certificate(
        &self,
        _ctx: &CallContext,
        lb_id: &str,
        name: &str,
    ) -> ApiResult<String> {
        self.enter("delete_certificate")?;
        let mut inner = self.inner.write();
        let lb = inner
            .load_balancers
            .get_mut(lb_id)
            .ok_or_else(|| CloudError::not_found(format!("load balancer {}", lb_id)))?;
        if lb.certificates.remove(name).is_none() {
            return Err(CloudError::not_found(format!("certificate {}", name)));
        }
        Ok(Self::succeeded_work_request(&mut inner))
    }

    async fn get_work_request(&self, _ctx: &CallContext, id: &str) -> ApiResult<WorkRequest> {
        self.enter("get_work_request")?;
        self.inner
            .read()
            .work_requests
            .get(id)
            .cloned()
            .ok_or_else(|| CloudError::not_found(format!("work request {}", id)))
    }
}

#[async_trait]
impl IdentityApi for FakeCloud {
    async fn list_availability_domains(
        &self,
        _ctx: &CallContext,
        _compartment_id: &str,
    ) -> ApiResult<Vec<AvailabilityDomain>> {
        self.enter("list_availability_domains")?;
        Ok(self.inner.read().availability_domains.clone())
    }

    async fn get_compartment(&self, _ctx: &CallContext, id: &str) -> ApiResult<Compartment> {
        self.enter("get_compartment")?;
        if id == self.compartment_id {
            Ok(Compartment {
                id: id.to_string(),
                name: "fake".into(),
            })
        } else {
            Err(CloudError::not_found(format!("compartment {}", id)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_etag_guard_on_security_list() {
        let fake = FakeCloud::new("c");
        let sl_id = fake.seed_security_list("no-such-subnet");
        let ctx = CallContext::background();

        let sl = fake.get_security_list(&ctx, &sl_id).await.unwrap();
        let rule = SecurityRule {
            description: Some("k8s".into()),
            cidr: "10.0.0.0/16".into(),
            protocol: "6".into(),
            port_min: 30_000,
            port_max: 30_000,
        };
        let updated = fake
            .update_security_list(&ctx, &sl_id, &sl.etag, vec![rule], vec![])
            .await
            .unwrap();
        assert_ne!(updated.etag, sl.etag);

        // The original etag is now stale.
        let err = fake
            .update_security_list(&ctx, &sl_id, &sl.etag, vec![], vec![])
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_lb_mutations_apply() {
        let fake = FakeCloud::new("c");
        let ctx = CallContext::background();
        fake.create_load_balancer(&ctx, &fake.sample_lb_details("lb"))
            .await
            .unwrap();
        let lb = fake.lb_by_name("lb").unwrap();

        let set = BackendSet {
            policy: "ROUND_ROBIN".into(),
            backends: vec![],
            health_check: HealthCheck::default(),
            session_persistence: None,
            ssl_config: None,
        };
        fake.create_backend_set(&ctx, &lb.id, "TCP-80", &set)
            .await
            .unwrap();
        let listener = Listener {
            port: 80,
            protocol: "TCP".into(),
            default_backend_set_name: "TCP-80".into(),
            ssl_config: None,
            idle_timeout_sec: None,
        };
        fake.create_listener(&ctx, &lb.id, "TCP-80", &listener)
            .await
            .unwrap();

        let lb = fake.lb_by_name("lb").unwrap();
        assert!(lb.backend_sets.contains_key("TCP-80"));
        assert!(lb.listeners.contains_key("TCP-80"));

        fake.delete_listener(&ctx, &lb.id, "TCP-80").await.unwrap();
        fake.delete_backend_set(&ctx, &lb.id, "TCP-80").await.unwrap();
        let lb = fake.lb_by_name("lb").unwrap();
        assert!(lb.backend_sets.is_empty());
        assert!(lb.listeners.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_lb_name_conflicts() {
        let fake = FakeCloud::new("c");
        let ctx = CallContext::background();
        let details = fake.sample_lb_details("lb");
        fake.create_load_balancer(&ctx, &details).await.unwrap();
        let err = fake.create_load_balancer(&ctx, &details).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.code.as_deref(), Some("AlreadyExists"));
    }

    #[tokio::test]
    async fn test_failure_injection_is_consumed() {
        let fake = FakeCloud::new("c");
        let vol = fake.seed_volume("v", "AD-1", 51_200, BTreeMap::new());
        fake.fail_times("get_volume", CloudError::transport("reset"), 1);
        let ctx = CallContext::background();

        assert!(fake.get_volume(&ctx, &vol).await.is_err());
        assert!(fake.get_volume(&ctx, &vol).await.is_ok());
    }
}
