//! Stack orchestrator
//!
//! Owns the stack lifecycle: validated create with dependency-ordered
//! provisioning and reverse-order rollback, start/stop/restart walks,
//! tolerant delete, and the read models. Provisioning runs on a
//! background task derived from the service lifetime, never from the
//! incoming request, so a client hang-up cannot abort it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::events::{EventAction, EventBus, EventKind, InfrastructureEvent};
use crate::resource::{
    ControllerError, CreateRequest, ResourceController, ResourceKind,
};
use crate::store::{
    Database, InfraStatus, StackResourceRow, StackRow, StackStatus, StoreError,
};

use super::graph;
use super::request::{CreateStackRequest, StackResourceRequest};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Operation in progress: {0}")]
    Busy(String),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Other(String),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Stack read model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackInfo {
    pub id: String,
    pub name: String,
    pub environment: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub status: StackStatus,
    pub status_detail: Option<String>,
    pub resources: Vec<StackResourceInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackResourceInfo {
    pub name: String,
    pub kind: ResourceKind,
    pub role: Option<String>,
    pub status: InfraStatus,
    pub infrastructure_id: Option<String>,
    pub depends_on: Vec<String>,
    pub order: i64,
    pub outputs: HashMap<String, String>,
    pub error: Option<String>,
}

impl StackResourceInfo {
    fn from_row(row: &StackResourceRow) -> Self {
        Self {
            name: row.declared_name.clone(),
            kind: row.kind,
            role: row.role.clone(),
            status: row.status,
            infrastructure_id: row.infrastructure_id.clone(),
            depends_on: row.depends_on.clone(),
            order: row.order,
            outputs: row.outputs.clone(),
            error: row.error.clone(),
        }
    }
}

pub struct StackOrchestrator {
    db: Arc<Database>,
    bus: EventBus,
    controllers: HashMap<ResourceKind, Arc<dyn ResourceController>>,

    /// Per-stack operation locks
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,

    /// Service lifetime token; provisioning jobs derive from this
    lifetime: CancellationToken,
}

impl StackOrchestrator {
    pub fn new(db: Arc<Database>, bus: EventBus, lifetime: CancellationToken) -> Self {
        Self {
            db,
            bus,
            controllers: HashMap::new(),
            locks: DashMap::new(),
            lifetime,
        }
    }

    pub fn register_controller(&mut self, controller: Arc<dyn ResourceController>) {
        self.controllers.insert(controller.kind(), controller);
    }

    fn controller_for(
        &self,
        kind: ResourceKind,
    ) -> OrchestratorResult<Arc<dyn ResourceController>> {
        self.controllers
            .get(&kind)
            .cloned()
            .ok_or_else(|| OrchestratorError::Other(format!("no controller for {}", kind)))
    }

    fn lock_for(&self, stack_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(stack_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Validate and persist a stack, then dispatch provisioning on a
    /// background task. Returns as soon as the rows are durable in
    /// CREATING; progress is observable via `get_stack` and the event
    /// stream.
    pub async fn create_stack(
        self: &Arc<Self>,
        owner_id: &str,
        req: CreateStackRequest,
    ) -> OrchestratorResult<StackInfo> {
        req.validate().map_err(OrchestratorError::Validation)?;

        let order = graph::topo_order(&req.resources)
            .map_err(|e| OrchestratorError::Validation(e.to_string()))?;

        // Kind schema checks, before any side effect
        for resource in &req.resources {
            let controller = self.controller_for(resource.kind)?;
            controller.validate(&resource.spec).map_err(|e| {
                OrchestratorError::Validation(format!(
                    "resource '{}': {}",
                    resource.name, e
                ))
            })?;
        }

        self.check_declared_ports(&req).await?;

        if self
            .db
            .stacks()
            .find_by_name(owner_id, &req.name)
            .await?
            .is_some()
        {
            return Err(OrchestratorError::Conflict(format!(
                "stack '{}' already exists",
                req.name
            )));
        }

        let stack_id = format!("stk-{}", Uuid::new_v4());
        let now = Utc::now();

        self.db
            .stacks()
            .insert(&StackRow {
                id: stack_id.clone(),
                owner_id: owner_id.to_string(),
                name: req.name.clone(),
                environment: req.environment.clone(),
                description: req.description.clone(),
                tags: req.tags.clone(),
                status: StackStatus::Creating,
                status_detail: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .map_err(|e| match e {
                StoreError::Duplicate(msg) => OrchestratorError::Conflict(msg),
                other => OrchestratorError::Store(other),
            })?;

        // Persist resources in topo position so later walks replay the
        // same order without recomputing depth
        for (position, &idx) in order.iter().enumerate() {
            let resource = &req.resources[idx];
            self.db
                .stacks()
                .insert_resource(&StackResourceRow {
                    stack_id: stack_id.clone(),
                    infrastructure_id: None,
                    declared_name: resource.name.clone(),
                    kind: resource.kind,
                    role: resource.role.clone(),
                    depends_on: resource.depends_on.clone(),
                    order: position as i64,
                    spec: resource.spec.clone(),
                    outputs: HashMap::new(),
                    status: InfraStatus::Creating,
                    error: None,
                })
                .await?;
        }

        info!(stack = %stack_id, name = %req.name, "stack accepted, dispatching provisioning");

        // Detached from the request: derive only from service lifetime
        let this = self.clone();
        let owner = owner_id.to_string();
        let job_stack_id = stack_id.clone();
        let ordered: Vec<StackResourceRequest> =
            order.iter().map(|&idx| req.resources[idx].clone()).collect();
        let job_token = self.lifetime.child_token();

        tokio::spawn(async move {
            this.provision(job_token, &owner, &job_stack_id, ordered).await;
        });

        self.get_stack(owner_id, &stack_id).await
    }

    /// Host ports declared in the request must be unique within it and
    /// free on the host.
    async fn check_declared_ports(&self, req: &CreateStackRequest) -> OrchestratorResult<()> {
        let mut seen: HashMap<u16, &str> = HashMap::new();

        for resource in &req.resources {
            for port in declared_host_ports(resource) {
                if let Some(other) = seen.insert(port, resource.name.as_str()) {
                    return Err(OrchestratorError::Validation(format!(
                        "host port {} declared by both '{}' and '{}'",
                        port, other, resource.name
                    )));
                }
                if self.db.infrastructure().port_in_use(port).await? {
                    return Err(OrchestratorError::Conflict(format!(
                        "host port {} (resource '{}') is already in use",
                        port, resource.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// The provisioning job: create each resource in topo order,
    /// substituting upstream outputs, rolling everything back on the
    /// first fatal failure.
    async fn provision(
        &self,
        token: CancellationToken,
        owner_id: &str,
        stack_id: &str,
        ordered: Vec<StackResourceRequest>,
    ) {
        let lock = self.lock_for(stack_id);
        let _guard = lock.lock().await;

        let mut outputs_by_name: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut created: Vec<(StackResourceRequest, String)> = Vec::new();
        let mut degraded = false;

        for resource in ordered {
            let result = self
                .provision_one(&token, owner_id, stack_id, &resource, &outputs_by_name)
                .await;

            match result {
                Ok(outcome) => {
                    if outcome.status == InfraStatus::Degraded {
                        degraded = true;
                    }
                    outputs_by_name.insert(resource.name.clone(), outcome.outputs.clone());
                    created.push((resource, outcome.infra_id));
                }
                Err(e) => {
                    error!(
                        stack = %stack_id,
                        resource = %resource.name,
                        "resource create failed: {}", e
                    );

                    let _ = self
                        .db
                        .stacks()
                        .update_resource_status(
                            stack_id,
                            &resource.name,
                            InfraStatus::Failed,
                            Some(&e.to_string()),
                        )
                        .await;

                    self.bus.publish(
                        InfrastructureEvent::new(
                            format!("{}:{}", stack_id, resource.name),
                            owner_id,
                            resource.kind,
                            EventAction::ResourceCreateFailed,
                        )
                        .with_metadata(serde_json::json!({
                            "stack_id": stack_id,
                            "resource": resource.name,
                            "error": e.to_string(),
                        })),
                    );

                    let rollback_report = self.rollback(owner_id, stack_id, &created).await;
                    let detail = match rollback_report {
                        Some(problems) => format!(
                            "resource '{}' failed: {}; rollback issues: {}",
                            resource.name, e, problems
                        ),
                        None => format!("resource '{}' failed: {}", resource.name, e),
                    };

                    let _ = self
                        .db
                        .stacks()
                        .update_status(stack_id, StackStatus::Failed, Some(&detail))
                        .await;
                    return;
                }
            }
        }

        // A degraded resource keeps the stack serving; the condition is
        // reflected in detail rather than a failed stack
        let status = StackStatus::Running;
        let detail = degraded.then(|| "one or more resources are degraded".to_string());
        if let Err(e) = self
            .db
            .stacks()
            .update_status(stack_id, status, detail.as_deref())
            .await
        {
            error!(stack = %stack_id, "failed to finalize stack status: {}", e);
            return;
        }

        self.bus.publish(
            InfrastructureEvent::new(
                stack_id,
                owner_id,
                EventKind::Stack,
                EventAction::StackCreated,
            )
            .with_metadata(serde_json::json!({
                "stack_id": stack_id,
                "status": status.as_str(),
            })),
        );

        info!(stack = %stack_id, "stack created");
    }

    async fn provision_one(
        &self,
        token: &CancellationToken,
        owner_id: &str,
        stack_id: &str,
        resource: &StackResourceRequest,
        outputs_by_name: &HashMap<String, HashMap<String, String>>,
    ) -> Result<crate::resource::CreateOutcome, ControllerError> {
        if token.is_cancelled() {
            return Err(ControllerError::Cancelled);
        }

        let spec = graph::substitute_placeholders(&resource.spec, outputs_by_name)
            .map_err(|e| ControllerError::Validation(e.to_string()))?;

        let controller = self
            .controllers
            .get(&resource.kind)
            .cloned()
            .ok_or_else(|| {
                ControllerError::Other(format!("no controller for {}", resource.kind))
            })?;

        let create_token = token.child_token();
        let request = CreateRequest {
            owner_id: owner_id.to_string(),
            stack_id: Some(stack_id.to_string()),
            declared_name: resource.name.clone(),
            infra_id: None,
            spec,
        };

        let outcome = match tokio::time::timeout(
            controller.create_deadline(),
            controller.create(create_token.clone(), request),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                create_token.cancel();
                return Err(ControllerError::Timeout);
            }
        };

        self.db
            .stacks()
            .bind_resource(stack_id, &resource.name, &outcome.infra_id)
            .await?;
        self.db
            .stacks()
            .set_resource_outputs(stack_id, &resource.name, &outcome.outputs)
            .await?;
        self.db
            .stacks()
            .update_resource_status(stack_id, &resource.name, outcome.status, None)
            .await?;

        self.bus.publish(
            InfrastructureEvent::new(
                &outcome.infra_id,
                owner_id,
                resource.kind,
                EventAction::ResourceCreated,
            )
            .with_metadata(serde_json::json!({
                "stack_id": stack_id,
                "resource": resource.name,
                "status": outcome.status.as_str(),
                "container_id": outcome.outputs.get("container_id"),
            })),
        );

        Ok(outcome)
    }

    /// Best-effort reverse-order teardown of already-created resources.
    /// Returns a summary of rollback problems, if any; they are
    /// recorded but never mask the original failure.
    async fn rollback(
        &self,
        owner_id: &str,
        stack_id: &str,
        created: &[(StackResourceRequest, String)],
    ) -> Option<String> {
        let mut problems = Vec::new();

        for (resource, infra_id) in created.iter().rev() {
            let controller = match self.controllers.get(&resource.kind) {
                Some(controller) => controller.clone(),
                None => continue,
            };

            info!(stack = %stack_id, resource = %resource.name, "rolling back");
            match controller
                .delete(CancellationToken::new(), infra_id)
                .await
            {
                Ok(()) => {
                    let _ = self
                        .db
                        .stacks()
                        .update_resource_status(
                            stack_id,
                            &resource.name,
                            InfraStatus::Deleted,
                            None,
                        )
                        .await;

                    self.bus.publish(
                        InfrastructureEvent::new(
                            infra_id,
                            owner_id,
                            resource.kind,
                            EventAction::ResourceDeleted,
                        )
                        .with_metadata(serde_json::json!({
                            "stack_id": stack_id,
                            "resource": resource.name,
                            "rollback": true,
                        })),
                    );
                }
                Err(e) => {
                    warn!(
                        stack = %stack_id,
                        resource = %resource.name,
                        "rollback delete failed: {}", e
                    );
                    let _ = self
                        .db
                        .stacks()
                        .update_resource_status(
                            stack_id,
                            &resource.name,
                            InfraStatus::Failed,
                            Some(&format!("rollback failed: {}", e)),
                        )
                        .await;
                    problems.push(format!("{}: {}", resource.name, e));
                }
            }
        }

        if problems.is_empty() {
            None
        } else {
            Some(problems.join("; "))
        }
    }

    pub async fn get_stack(&self, owner_id: &str, stack_id: &str) -> OrchestratorResult<StackInfo> {
        let stack = self.owned_stack(owner_id, stack_id).await?;
        let resources = self.db.stacks().resources(stack_id).await?;

        Ok(StackInfo {
            id: stack.id,
            name: stack.name,
            environment: stack.environment,
            description: stack.description,
            tags: stack.tags,
            status: stack.status,
            status_detail: stack.status_detail,
            resources: resources.iter().map(StackResourceInfo::from_row).collect(),
            created_at: stack.created_at,
            updated_at: stack.updated_at,
        })
    }

    pub async fn list_stacks(
        &self,
        owner_id: &str,
        page: u32,
        per_page: u32,
    ) -> OrchestratorResult<Vec<StackInfo>> {
        let per_page = per_page.clamp(1, 100);
        let offset = page.saturating_sub(1) * per_page;
        let rows = self.db.stacks().list(owner_id, per_page, offset).await?;

        let mut stacks = Vec::with_capacity(rows.len());
        for row in rows {
            let resources = self.db.stacks().resources(&row.id).await?;
            stacks.push(StackInfo {
                id: row.id,
                name: row.name,
                environment: row.environment,
                description: row.description,
                tags: row.tags,
                status: row.status,
                status_detail: row.status_detail,
                resources: resources.iter().map(StackResourceInfo::from_row).collect(),
                created_at: row.created_at,
                updated_at: row.updated_at,
            });
        }
        Ok(stacks)
    }

    async fn owned_stack(&self, owner_id: &str, stack_id: &str) -> OrchestratorResult<StackRow> {
        let stack = self
            .db
            .stacks()
            .get(stack_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("stack {}", stack_id)))?;

        if stack.owner_id != owner_id {
            // Other owners' stacks are indistinguishable from absent
            return Err(OrchestratorError::NotFound(format!("stack {}", stack_id)));
        }
        Ok(stack)
    }

    /// Delete in reverse provisioning order. Tolerant: missing
    /// containers are fine, and re-deleting a deleted stack succeeds.
    /// Once past the first teardown the operation drives to completion;
    /// failures leave DELETE_FAILED with the dangling resources listed.
    pub async fn delete_stack(&self, owner_id: &str, stack_id: &str) -> OrchestratorResult<()> {
        let stack = self.owned_stack(owner_id, stack_id).await?;
        if stack.status == StackStatus::Deleted {
            return Ok(());
        }

        let lock = self.lock_for(stack_id);
        let _guard = lock.lock().await;

        self.db
            .stacks()
            .update_status(stack_id, StackStatus::Deleting, None)
            .await?;

        let mut resources = self.db.stacks().resources(stack_id).await?;
        // Stored order is the provisioning order; tear down in reverse
        resources.sort_by_key(|r| std::cmp::Reverse(r.order));

        let mut dangling = Vec::new();

        for resource in &resources {
            let Some(infra_id) = &resource.infrastructure_id else {
                continue;
            };
            if resource.status == InfraStatus::Deleted {
                continue;
            }

            let controller = match self.controllers.get(&resource.kind) {
                Some(controller) => controller.clone(),
                None => continue,
            };

            match controller.delete(CancellationToken::new(), infra_id).await {
                Ok(()) | Err(ControllerError::NotFound(_)) => {
                    let _ = self
                        .db
                        .stacks()
                        .update_resource_status(
                            stack_id,
                            &resource.declared_name,
                            InfraStatus::Deleted,
                            None,
                        )
                        .await;

                    self.bus.publish(
                        InfrastructureEvent::new(
                            infra_id,
                            owner_id,
                            resource.kind,
                            EventAction::ResourceDeleted,
                        )
                        .with_metadata(serde_json::json!({
                            "stack_id": stack_id,
                            "resource": resource.declared_name,
                        })),
                    );
                }
                Err(e) => {
                    warn!(
                        stack = %stack_id,
                        resource = %resource.declared_name,
                        "delete failed: {}", e
                    );
                    dangling.push(format!("{}: {}", resource.declared_name, e));
                }
            }
        }

        if dangling.is_empty() {
            self.db
                .stacks()
                .update_status(stack_id, StackStatus::Deleted, None)
                .await?;

            self.bus.publish(
                InfrastructureEvent::new(
                    stack_id,
                    owner_id,
                    EventKind::Stack,
                    EventAction::StackDeleted,
                )
                .with_metadata(serde_json::json!({ "stack_id": stack_id })),
            );
            info!(stack = %stack_id, "stack deleted");
            Ok(())
        } else {
            let detail = format!("dangling resources: {}", dangling.join("; "));
            self.db
                .stacks()
                .update_status(stack_id, StackStatus::DeleteFailed, Some(&detail))
                .await?;
            Err(OrchestratorError::Other(detail))
        }
    }

    /// Start every resource in provisioning order.
    pub async fn start_stack(&self, owner_id: &str, stack_id: &str) -> OrchestratorResult<()> {
        self.owned_stack(owner_id, stack_id).await?;
        let lock = self.lock_for(stack_id);
        let _guard = lock.lock().await;

        let resources = self.db.stacks().resources(stack_id).await?;

        for resource in &resources {
            let Some(infra_id) = &resource.infrastructure_id else {
                continue;
            };
            let controller = self.controller_for(resource.kind)?;

            self.bus.publish(
                InfrastructureEvent::new(
                    infra_id,
                    owner_id,
                    resource.kind,
                    EventAction::StartRequested,
                )
                .with_metadata(serde_json::json!({ "stack_id": stack_id })),
            );

            controller
                .start(self.lifetime.child_token(), infra_id)
                .await?;
            self.db
                .stacks()
                .update_resource_status(
                    stack_id,
                    &resource.declared_name,
                    InfraStatus::Running,
                    None,
                )
                .await?;
        }

        self.db
            .stacks()
            .update_status(stack_id, StackStatus::Running, None)
            .await?;
        Ok(())
    }

    /// Stop every resource in reverse provisioning order.
    pub async fn stop_stack(&self, owner_id: &str, stack_id: &str) -> OrchestratorResult<()> {
        self.owned_stack(owner_id, stack_id).await?;
        let lock = self.lock_for(stack_id);
        let _guard = lock.lock().await;

        let mut resources = self.db.stacks().resources(stack_id).await?;
        resources.sort_by_key(|r| std::cmp::Reverse(r.order));

        for resource in &resources {
            let Some(infra_id) = &resource.infrastructure_id else {
                continue;
            };
            let controller = self.controller_for(resource.kind)?;

            self.bus.publish(
                InfrastructureEvent::new(
                    infra_id,
                    owner_id,
                    resource.kind,
                    EventAction::StopRequested,
                )
                .with_metadata(serde_json::json!({ "stack_id": stack_id })),
            );

            controller
                .stop(self.lifetime.child_token(), infra_id)
                .await?;
            self.db
                .stacks()
                .update_resource_status(
                    stack_id,
                    &resource.declared_name,
                    InfraStatus::Stopped,
                    None,
                )
                .await?;
        }

        self.db
            .stacks()
            .update_status(stack_id, StackStatus::Stopped, None)
            .await?;
        Ok(())
    }

    pub async fn restart_stack(&self, owner_id: &str, stack_id: &str) -> OrchestratorResult<()> {
        self.stop_stack(owner_id, stack_id).await?;
        self.start_stack(owner_id, stack_id).await
    }

    /// Per-resource log tails
    pub async fn stack_logs(
        &self,
        owner_id: &str,
        stack_id: &str,
        tail: u32,
    ) -> OrchestratorResult<HashMap<String, Vec<String>>> {
        self.owned_stack(owner_id, stack_id).await?;
        let resources = self.db.stacks().resources(stack_id).await?;

        let mut logs = HashMap::new();
        for resource in &resources {
            let Some(infra_id) = &resource.infrastructure_id else {
                continue;
            };
            let controller = self.controller_for(resource.kind)?;
            match controller.logs(infra_id, tail).await {
                Ok(lines) => {
                    logs.insert(resource.declared_name.clone(), lines);
                }
                Err(e) => {
                    logs.insert(
                        resource.declared_name.clone(),
                        vec![format!("<unavailable: {}>", e)],
                    );
                }
            }
        }
        Ok(logs)
    }

    /// Per-resource stats snapshots
    pub async fn stack_metrics(
        &self,
        owner_id: &str,
        stack_id: &str,
    ) -> OrchestratorResult<HashMap<String, serde_json::Value>> {
        self.owned_stack(owner_id, stack_id).await?;
        let resources = self.db.stacks().resources(stack_id).await?;

        let mut metrics = HashMap::new();
        for resource in &resources {
            let Some(infra_id) = &resource.infrastructure_id else {
                continue;
            };
            let controller = self.controller_for(resource.kind)?;
            if let Ok(snapshot) = controller.stats(infra_id).await {
                metrics.insert(resource.declared_name.clone(), snapshot);
            }
        }
        Ok(metrics)
    }

    /// Reconstruct the declarative request, secrets redacted.
    pub async fn export_stack(
        &self,
        owner_id: &str,
        stack_id: &str,
    ) -> OrchestratorResult<CreateStackRequest> {
        let mut request = self.stored_request(owner_id, stack_id).await?;
        for resource in &mut request.resources {
            redact_secrets(&mut resource.spec);
        }
        Ok(request)
    }

    /// Re-submit an existing stack's definition under a new name.
    pub async fn clone_stack(
        self: &Arc<Self>,
        owner_id: &str,
        stack_id: &str,
        new_name: &str,
    ) -> OrchestratorResult<StackInfo> {
        let mut request = self.stored_request(owner_id, stack_id).await?;
        request.name = new_name.to_string();
        self.create_stack(owner_id, request).await
    }

    async fn stored_request(
        &self,
        owner_id: &str,
        stack_id: &str,
    ) -> OrchestratorResult<CreateStackRequest> {
        let stack = self.owned_stack(owner_id, stack_id).await?;
        let resources = self.db.stacks().resources(stack_id).await?;

        Ok(CreateStackRequest {
            name: stack.name,
            environment: stack.environment,
            description: stack.description,
            tags: stack.tags,
            resources: resources
                .into_iter()
                .map(|row| StackResourceRequest {
                    name: row.declared_name,
                    kind: row.kind,
                    role: row.role,
                    depends_on: row.depends_on,
                    order: row.order,
                    spec: row.spec,
                })
                .collect(),
        })
    }
}

/// Host ports a resource spec pins explicitly
fn declared_host_ports(resource: &StackResourceRequest) -> Vec<u16> {
    let mut ports = Vec::new();
    match resource.kind {
        ResourceKind::DockerService => {
            if let Some(list) = resource.spec.get("ports").and_then(|v| v.as_array()) {
                for entry in list {
                    if let Some(port) = entry.get("host").and_then(|v| v.as_u64()) {
                        ports.push(port as u16);
                    }
                }
            }
        }
        ResourceKind::NginxGateway => {
            if let Some(port) = resource.spec.get("port").and_then(|v| v.as_u64()) {
                ports.push(port as u16);
            }
        }
        ResourceKind::PostgresCluster => {
            for key in ["primary_port", "replica_port"] {
                if let Some(port) = resource.spec.get(key).and_then(|v| v.as_u64()) {
                    ports.push(port as u16);
                }
            }
        }
    }
    ports
}

/// Blank out anything that looks like a credential before export
fn redact_secrets(spec: &mut serde_json::Value) {
    match spec {
        serde_json::Value::Object(map) => {
            for (key, value) in map.iter_mut() {
                if key.to_ascii_lowercase().contains("password")
                    || key.to_ascii_lowercase().contains("secret")
                {
                    *value = serde_json::Value::String("<redacted>".to_string());
                } else {
                    redact_secrets(value);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                redact_secrets(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProvisioningConfiguration;
    use crate::events::{DurableEventSink, RuntimeEventBridge};
    use crate::resource::{DockerServiceController, NginxGatewayController};
    use crate::runtime::fake::FakeRuntime;
    use crate::runtime::ContainerRuntime;
    use crate::runtime::ExecOutput;
    use std::time::Duration;

    struct Harness {
        orchestrator: Arc<StackOrchestrator>,
        runtime: Arc<FakeRuntime>,
        db: Arc<Database>,
        bus: EventBus,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let bus = EventBus::new();
        let lifetime = CancellationToken::new();

        let mut orchestrator =
            StackOrchestrator::new(db.clone(), bus.clone(), lifetime);
        orchestrator.register_controller(Arc::new(DockerServiceController::new(
            runtime.clone(),
            db.clone(),
            ProvisioningConfiguration::default(),
        )));
        orchestrator.register_controller(Arc::new(NginxGatewayController::new(
            runtime.clone(),
            db.clone(),
            ProvisioningConfiguration::default(),
            dir.path().to_path_buf(),
        )));

        Harness {
            orchestrator: Arc::new(orchestrator),
            runtime,
            db,
            bus,
            _dir: dir,
        }
    }

    fn service(name: &str, deps: &[&str]) -> StackResourceRequest {
        StackResourceRequest {
            name: name.to_string(),
            kind: ResourceKind::DockerService,
            role: None,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            order: 0,
            spec: serde_json::json!({ "image": "busybox" }),
        }
    }

    fn request(name: &str, resources: Vec<StackResourceRequest>) -> CreateStackRequest {
        CreateStackRequest {
            name: name.to_string(),
            environment: "development".to_string(),
            description: None,
            tags: vec![],
            resources,
        }
    }

    /// Poll until the stack settles out of CREATING
    async fn wait_settled(harness: &Harness, owner: &str, stack_id: &str) -> StackInfo {
        for _ in 0..200 {
            let info = harness
                .orchestrator
                .get_stack(owner, stack_id)
                .await
                .unwrap();
            if info.status != StackStatus::Creating {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("stack {} never settled", stack_id);
    }

    #[tokio::test]
    async fn test_happy_stack_provisions_in_dependency_order() {
        let harness = harness();
        let mut events = harness.bus.subscribe();

        let gw = StackResourceRequest {
            name: "gw".to_string(),
            kind: ResourceKind::NginxGateway,
            role: None,
            depends_on: vec!["db".to_string()],
            order: 0,
            spec: serde_json::json!({ "port": 8080 }),
        };

        let created = harness
            .orchestrator
            .create_stack("u-1", request("web", vec![gw, service("db", &[])]))
            .await
            .unwrap();
        assert_eq!(created.status, StackStatus::Creating);

        let info = wait_settled(&harness, "u-1", &created.id).await;
        assert_eq!(info.status, StackStatus::Running);
        assert_eq!(info.resources.len(), 2);

        // Stored order is provisioning order: db before gw
        assert_eq!(info.resources[0].name, "db");
        assert_eq!(info.resources[1].name, "gw");
        assert!(info.resources[0].outputs.contains_key("container_id"));
        assert_eq!(harness.runtime.container_count(), 2);

        // resource.created for db precedes gw's, then stack.created
        let mut creation_order = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event.action {
                EventAction::ResourceCreated => creation_order.push(
                    event.metadata["resource"].as_str().unwrap().to_string(),
                ),
                EventAction::StackCreated => creation_order.push("<stack>".to_string()),
                _ => {}
            }
        }
        assert_eq!(creation_order, ["db", "gw", "<stack>"]);
    }

    #[tokio::test]
    async fn test_outputs_substitute_into_downstream_specs() {
        let harness = harness();

        let mut app = service("app", &["db"]);
        app.spec = serde_json::json!({
            "image": "myapp",
            "env": { "DATABASE_URL": "postgres://u:p@${db.endpoint}/app" },
        });
        let mut db = service("db", &[]);
        db.spec = serde_json::json!({
            "image": "postgres",
            "ports": [{ "container": 5432, "host": 25432 }],
        });

        let created = harness
            .orchestrator
            .create_stack("u-1", request("web", vec![app, db]))
            .await
            .unwrap();
        let info = wait_settled(&harness, "u-1", &created.id).await;
        assert_eq!(info.status, StackStatus::Running);

        let app_container = harness.runtime.container_by_name(
            &format!(
                "stackd-app-{}",
                &info.resources[1].infrastructure_id.as_ref().unwrap()[4..12]
            ),
        );
        let env = app_container.unwrap().spec.env;
        assert_eq!(
            env.get("DATABASE_URL").map(|s| s.as_str()),
            Some("postgres://u:p@localhost:25432/app")
        );
    }

    #[tokio::test]
    async fn test_failure_rolls_back_created_resources() {
        let harness = harness();
        let mut events = harness.bus.subscribe();

        // gw's config check fails inside the container
        harness.runtime.script_exec(
            "nginx -t",
            ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "unknown directive".to_string(),
            },
        );

        let gw = StackResourceRequest {
            name: "gw".to_string(),
            kind: ResourceKind::NginxGateway,
            role: None,
            depends_on: vec!["db".to_string()],
            order: 0,
            spec: serde_json::json!({ "port": 8080 }),
        };

        let created = harness
            .orchestrator
            .create_stack("u-1", request("web", vec![service("db", &[]), gw]))
            .await
            .unwrap();

        let info = wait_settled(&harness, "u-1", &created.id).await;
        assert_eq!(info.status, StackStatus::Failed);
        assert!(info.status_detail.as_ref().unwrap().contains("gw"));

        // The db container was rolled back; nothing is left behind
        assert_eq!(harness.runtime.container_count(), 0);

        let db_row = info.resources.iter().find(|r| r.name == "db").unwrap();
        assert_eq!(db_row.status, InfraStatus::Deleted);
        let gw_row = info.resources.iter().find(|r| r.name == "gw").unwrap();
        assert_eq!(gw_row.status, InfraStatus::Failed);

        // Event trail: db created, gw failed, db rolled back
        let mut actions = Vec::new();
        while let Ok(event) = events.try_recv() {
            actions.push(event.action);
        }
        assert!(actions.contains(&EventAction::ResourceCreated));
        assert!(actions.contains(&EventAction::ResourceCreateFailed));
        assert!(actions.contains(&EventAction::ResourceDeleted));
        assert!(!actions.contains(&EventAction::StackCreated));
    }

    #[tokio::test]
    async fn test_unknown_dependency_fails_before_side_effects() {
        let harness = harness();

        let err = harness
            .orchestrator
            .create_stack("u-1", request("web", vec![service("app", &["db"])]))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert_eq!(harness.runtime.container_count(), 0);
        assert!(harness
            .orchestrator
            .list_stacks("u-1", 1, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_cycle_fails_validation() {
        let harness = harness();

        let err = harness
            .orchestrator
            .create_stack(
                "u-1",
                request("web", vec![service("a", &["b"]), service("b", &["a"])]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn test_duplicate_stack_name_conflicts() {
        let harness = harness();

        let created = harness
            .orchestrator
            .create_stack("u-1", request("web", vec![service("db", &[])]))
            .await
            .unwrap();
        wait_settled(&harness, "u-1", &created.id).await;

        let err = harness
            .orchestrator
            .create_stack("u-1", request("web", vec![service("db", &[])]))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_duplicate_declared_ports_rejected() {
        let harness = harness();

        let mut a = service("a", &[]);
        a.spec = serde_json::json!({
            "image": "x", "ports": [{ "container": 80, "host": 28080 }],
        });
        let mut b = service("b", &[]);
        b.spec = serde_json::json!({
            "image": "y", "ports": [{ "container": 81, "host": 28080 }],
        });

        let err = harness
            .orchestrator
            .create_stack("u-1", request("web", vec![a, b]))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn test_order_values_break_depth_ties() {
        let harness = harness();
        let mut events = harness.bus.subscribe();

        let mut c = service("c", &[]);
        c.order = 3;
        let mut a = service("a", &[]);
        a.order = 1;
        let mut b = service("b", &[]);
        b.order = 2;

        let created = harness
            .orchestrator
            .create_stack("u-1", request("web", vec![c, a, b]))
            .await
            .unwrap();
        wait_settled(&harness, "u-1", &created.id).await;

        let mut creation = Vec::new();
        while let Ok(event) = events.try_recv() {
            if event.action == EventAction::ResourceCreated {
                creation.push(event.metadata["resource"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(creation, ["a", "b", "c"]);

        // Deletion replays the stored order in reverse
        let mut events = harness.bus.subscribe();
        harness
            .orchestrator
            .delete_stack("u-1", &created.id)
            .await
            .unwrap();

        let mut deletion = Vec::new();
        while let Ok(event) = events.try_recv() {
            if event.action == EventAction::ResourceDeleted {
                deletion.push(event.metadata["resource"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(deletion, ["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_leaves_nothing() {
        let harness = harness();

        let created = harness
            .orchestrator
            .create_stack(
                "u-1",
                request("web", vec![service("db", &[]), service("app", &["db"])]),
            )
            .await
            .unwrap();
        wait_settled(&harness, "u-1", &created.id).await;
        assert_eq!(harness.runtime.container_count(), 2);

        harness
            .orchestrator
            .delete_stack("u-1", &created.id)
            .await
            .unwrap();
        assert_eq!(harness.runtime.container_count(), 0);

        let info = harness
            .orchestrator
            .get_stack("u-1", &created.id)
            .await
            .unwrap();
        assert_eq!(info.status, StackStatus::Deleted);

        // Second delete is a success, not an error
        harness
            .orchestrator
            .delete_stack("u-1", &created.id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_containers() {
        let harness = harness();

        let created = harness
            .orchestrator
            .create_stack("u-1", request("web", vec![service("db", &[])]))
            .await
            .unwrap();
        let info = wait_settled(&harness, "u-1", &created.id).await;

        // Remove the container out-of-band
        let container = info.resources[0].outputs.get("container_id").unwrap();
        harness.runtime.remove_container(container, true).await.unwrap();

        harness
            .orchestrator
            .delete_stack("u-1", &created.id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_other_owner_sees_not_found() {
        let harness = harness();

        let created = harness
            .orchestrator
            .create_stack("u-1", request("web", vec![service("db", &[])]))
            .await
            .unwrap();
        wait_settled(&harness, "u-1", &created.id).await;

        let err = harness
            .orchestrator
            .get_stack("u-2", &created.id)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_restart_event_sequence_per_instance() {
        let dir = tempfile::tempdir().unwrap();
        let harness = harness();

        // Wire bridge and durable sink so engine events land in the log
        let sink = DurableEventSink::for_tests(dir.path().to_path_buf());
        let shutdown = CancellationToken::new();
        let (durable_tx, mut committed_rx) = sink.spawn(shutdown.clone());
        harness.bus.attach_durable(durable_tx);

        let bridge = RuntimeEventBridge::new(
            harness.runtime.clone(),
            harness.db.clone(),
            harness.bus.clone(),
        );
        let bridge_task = bridge.spawn(shutdown.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let created = harness
            .orchestrator
            .create_stack("u-1", request("web", vec![service("db", &[])]))
            .await
            .unwrap();
        let info = wait_settled(&harness, "u-1", &created.id).await;
        let infra_id = info.resources[0].infrastructure_id.clone().unwrap();

        // Drain create-time events before the restart
        while tokio::time::timeout(Duration::from_millis(100), committed_rx.recv())
            .await
            .is_ok()
        {}

        harness
            .orchestrator
            .stop_stack("u-1", &created.id)
            .await
            .unwrap();
        // Let the bridge observe the die before start is requested
        tokio::time::sleep(Duration::from_millis(100)).await;
        harness
            .orchestrator
            .start_stack("u-1", &created.id)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let actions: Vec<EventAction> = sink
            .read_instance(&infra_id)
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .filter(|a| {
                matches!(
                    a,
                    EventAction::StopRequested
                        | EventAction::Die
                        | EventAction::StartRequested
                        | EventAction::Start
                )
            })
            .collect();

        assert_eq!(
            actions,
            [
                EventAction::StopRequested,
                EventAction::Die,
                EventAction::StartRequested,
                EventAction::Start,
            ]
        );

        shutdown.cancel();
        let _ = bridge_task.await;
    }

    #[tokio::test]
    async fn test_stop_then_start_preserves_bindings() {
        let harness = harness();

        let mut db = service("db", &[]);
        db.spec = serde_json::json!({
            "image": "postgres",
            "ports": [{ "container": 5432, "host": 25433 }],
        });

        let created = harness
            .orchestrator
            .create_stack("u-1", request("web", vec![db]))
            .await
            .unwrap();
        let before = wait_settled(&harness, "u-1", &created.id).await;
        let container_before = before.resources[0].outputs.get("container_id").cloned();

        harness.orchestrator.stop_stack("u-1", &created.id).await.unwrap();
        harness.orchestrator.start_stack("u-1", &created.id).await.unwrap();

        let after = harness
            .orchestrator
            .get_stack("u-1", &created.id)
            .await
            .unwrap();
        assert_eq!(after.status, StackStatus::Running);
        assert_eq!(
            after.resources[0].outputs.get("container_id").cloned(),
            container_before
        );
        assert_eq!(
            after.resources[0].outputs.get("port_5432").map(|s| s.as_str()),
            Some("25433")
        );
    }

    #[tokio::test]
    async fn test_export_redacts_and_clone_reuses() {
        let harness = harness();

        let mut db = service("db", &[]);
        db.spec = serde_json::json!({ "image": "postgres", "env": { "POSTGRES_PASSWORD": "supersecret" } });

        let created = harness
            .orchestrator
            .create_stack("u-1", request("web", vec![db]))
            .await
            .unwrap();
        wait_settled(&harness, "u-1", &created.id).await;

        let exported = harness
            .orchestrator
            .export_stack("u-1", &created.id)
            .await
            .unwrap();
        assert_eq!(
            exported.resources[0].spec["env"]["POSTGRES_PASSWORD"],
            "<redacted>"
        );

        let clone = harness
            .orchestrator
            .clone_stack("u-1", &created.id, "web-copy")
            .await
            .unwrap();
        let cloned = wait_settled(&harness, "u-1", &clone.id).await;
        assert_eq!(cloned.status, StackStatus::Running);
        assert_eq!(cloned.name, "web-copy");
    }
}
