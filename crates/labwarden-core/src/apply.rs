//! Apply executor
//!
//! Walks a [`Plan`] in order against the registered providers. The
//! default policy is fail-fast: the first adapter failure halts the run
//! and the report shows what was applied, what failed, and what was
//! never attempted. Partial application is a legitimate terminal state;
//! nothing is rolled back, and the next plan picks up from the updated
//! observed state. With `continue_on_error`, only the transitive
//! dependents of a failed resource are skipped.

use crate::error::ApplyError;
use crate::exports::ExportStore;
use crate::plan::{OpKind, Operation, Plan};
use crate::provider::ProviderRegistry;
use crate::resource::{Attributes, DesiredState, ResourceKey, ResourceSpec};
use crate::state::{ObservedState, ResourceRecord};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use std::time::Instant;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z0-9_-]+)\.([A-Za-z0-9_]+)\}").expect("placeholder regex")
});

/// Execution policy knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    /// Keep applying independent branches after a failure instead of
    /// halting.
    pub continue_on_error: bool,

    /// Allow destructive replace operations to run.
    pub approve_destructive: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedOperation {
    pub key: ResourceKey,
    pub op: OpKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedOperation {
    pub key: ResourceKey,
    pub op: OpKind,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedOperation {
    pub key: ResourceKey,
    pub op: OpKind,
}

/// Outcome of an apply run: the completed prefix (or branches), the
/// failures with their resource identity, and the operations never
/// attempted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    pub applied: Vec<AppliedOperation>,
    pub failed: Vec<FailedOperation>,
    pub skipped: Vec<SkippedOperation>,
    pub unchanged: usize,
    pub duration_ms: u64,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl std::fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} applied, {} failed, {} not attempted, {} unchanged",
            self.applied.len(),
            self.failed.len(),
            self.skipped.len(),
            self.unchanged
        )
    }
}

/// Execute `plan` against the registered providers, updating `state`
/// and publishing `exports` as operations complete.
///
/// Returns `Err` only for pre-flight refusals (unapproved destructive
/// plan, unregistered provider) raised before any provider call.
/// Adapter failures are reported through the [`ApplyReport`].
pub async fn apply(
    plan: &Plan,
    desired: &DesiredState,
    state: &mut ObservedState,
    registry: &ProviderRegistry,
    exports: &ExportStore,
    options: &ApplyOptions,
) -> Result<ApplyReport, ApplyError> {
    // Pre-flight: nothing below may touch a provider until these pass.
    if !options.approve_destructive {
        if let Some(op) = plan.operations.iter().find(|o| o.destructive) {
            return Err(ApplyError::DestructiveNotApproved(op.key.clone()));
        }
    }
    for op in &plan.operations {
        let provider = provider_name(op, desired, state);
        if let Some(name) = provider {
            if registry.get(&name).is_none() {
                return Err(ApplyError::UnknownProvider(name));
            }
        }
    }

    let started = Instant::now();
    let mut report = ApplyReport::default();

    // Attributes of every resource usable for `${name.attr}` lookups:
    // seeded from the observed state, refreshed as operations land.
    let mut resolved: BTreeMap<String, Attributes> = BTreeMap::new();
    for spec in desired.resources() {
        if let Some(record) = state.get(&spec.key()) {
            resolved.insert(spec.name.clone(), record_context(record));
        }
    }

    // Names whose operation failed or was skipped; anything depending
    // on them is skipped in turn.
    let mut blocked: BTreeSet<String> = BTreeSet::new();
    let mut halted = false;

    for op in &plan.operations {
        if halted {
            if op.op != OpKind::NoOp {
                report.skipped.push(SkippedOperation {
                    key: op.key.clone(),
                    op: op.op,
                });
            }
            continue;
        }

        let spec = desired.get(&op.key);

        if let Some(spec) = spec {
            if spec.depends_on.iter().any(|d| blocked.contains(d)) {
                tracing::warn!(resource = %op.key, "skipping: dependency failed");
                blocked.insert(spec.name.clone());
                report.skipped.push(SkippedOperation {
                    key: op.key.clone(),
                    op: op.op,
                });
                continue;
            }
        }

        match execute(op, spec, state, registry, exports, &mut resolved).await {
            Ok(ExecOutcome::Unchanged) => report.unchanged += 1,
            Ok(ExecOutcome::Applied(message)) => {
                tracing::info!(resource = %op.key, op = %op.op, "applied");
                report.applied.push(AppliedOperation {
                    key: op.key.clone(),
                    op: op.op,
                    message,
                });
            }
            Err(err) => {
                tracing::error!(resource = %op.key, op = %op.op, error = %err, "operation failed");
                report.failed.push(FailedOperation {
                    key: op.key.clone(),
                    op: op.op,
                    error: err.to_string(),
                });
                if let Some(spec) = spec {
                    blocked.insert(spec.name.clone());
                }
                // Conflicting exports poison the whole run; provider
                // failures only halt it under the default policy.
                if matches!(err, ApplyError::DuplicateExport(_)) || !options.continue_on_error {
                    halted = true;
                }
            }
        }
    }

    report.duration_ms = started.elapsed().as_millis() as u64;
    tracing::info!(%report, "apply finished");
    Ok(report)
}

enum ExecOutcome {
    Applied(String),
    Unchanged,
}

async fn execute(
    op: &Operation,
    spec: Option<&ResourceSpec>,
    state: &mut ObservedState,
    registry: &ProviderRegistry,
    exports: &ExportStore,
    resolved: &mut BTreeMap<String, Attributes>,
) -> Result<ExecOutcome, ApplyError> {
    match op.op {
        OpKind::NoOp => {
            if let (Some(spec), Some(record)) = (spec, state.get(&op.key)) {
                publish_exports(spec, &record.attributes.clone(), exports)?;
            }
            Ok(ExecOutcome::Unchanged)
        }
        OpKind::Create => {
            let spec = spec.ok_or_else(|| ApplyError::UnknownProvider(op.key.to_string()))?;
            create_resource(spec, state, registry, exports, resolved).await?;
            Ok(ExecOutcome::Applied("created".to_string()))
        }
        OpKind::Update => {
            let spec = spec.ok_or_else(|| ApplyError::UnknownProvider(op.key.to_string()))?;
            let provider = lookup(registry, &spec.provider)?;

            // The record is updated with the declared values (placeholders
            // as written); the adapter sees them resolved.
            let mut changes = Attributes::new();
            for (field, change) in &op.diff {
                if let Some(to) = &change.to {
                    changes.insert(field.clone(), to.clone());
                }
            }
            let resolved_changes = resolve_attributes(&op.key, &changes, resolved)?;

            provider
                .update(spec.kind, &spec.name, &resolved_changes)
                .await
                .map_err(|source| ApplyError::Provider {
                    key: op.key.clone(),
                    source,
                })?;

            if let Some(record) = state.get_mut(&op.key) {
                for (field, value) in &changes {
                    record.set_attribute(field.clone(), value.clone());
                }
            }
            if let Some(record) = state.get(&op.key) {
                // Context and exports carry the resolved values on top of
                // the record.
                let mut live = record_context(record);
                live.extend(resolved_changes);
                resolved.insert(spec.name.clone(), live.clone());
                publish_exports(spec, &live, exports)?;
            }
            Ok(ExecOutcome::Applied("updated".to_string()))
        }
        OpKind::Replace => {
            let spec = spec.ok_or_else(|| ApplyError::UnknownProvider(op.key.to_string()))?;
            let provider = lookup(registry, &spec.provider)?;

            provider
                .delete(spec.kind, &spec.name)
                .await
                .map_err(|source| ApplyError::Provider {
                    key: op.key.clone(),
                    source,
                })?;
            state.remove(&op.key);
            resolved.remove(&spec.name);

            create_resource(spec, state, registry, exports, resolved).await?;
            Ok(ExecOutcome::Applied("replaced".to_string()))
        }
        OpKind::Delete => {
            // Orphan deletes have no spec; the record knows its provider.
            let (provider_name, _) = match spec {
                Some(spec) => (spec.provider.clone(), spec.kind),
                None => {
                    let record = state
                        .get(&op.key)
                        .ok_or_else(|| ApplyError::UnknownProvider(op.key.to_string()))?;
                    (record.provider.clone(), record.kind)
                }
            };
            let provider = lookup(registry, &provider_name)?;

            provider
                .delete(op.key.kind, &op.key.name)
                .await
                .map_err(|source| ApplyError::Provider {
                    key: op.key.clone(),
                    source,
                })?;
            state.remove(&op.key);
            resolved.remove(&op.key.name);
            Ok(ExecOutcome::Applied("deleted".to_string()))
        }
    }
}

async fn create_resource(
    spec: &ResourceSpec,
    state: &mut ObservedState,
    registry: &ProviderRegistry,
    exports: &ExportStore,
    resolved: &mut BTreeMap<String, Attributes>,
) -> Result<(), ApplyError> {
    let provider = lookup(registry, &spec.provider)?;
    let key = spec.key();

    let attributes = resolve_attributes(&key, &spec.attributes, resolved)?;
    let mut resolved_spec = spec.clone();
    resolved_spec.attributes = attributes;

    let created = provider
        .create(&resolved_spec)
        .await
        .map_err(|source| ApplyError::Provider {
            key: key.clone(),
            source,
        })?;

    // The record keeps the declared attributes as written, placeholders
    // included, so the next plan diffs them against the same text and
    // converges to NoOp. Resolution happens per adapter call only.
    // Provider-reported extras are kept alongside.
    let mut record_attrs = created.attributes.clone();
    record_attrs.extend(spec.attributes.clone());

    // Downstream placeholders and exports see the resolved values.
    let mut live = created.attributes;
    live.extend(resolved_spec.attributes);
    live.insert("id".to_string(), serde_json::Value::String(created.id.clone()));

    let record = ResourceRecord::new(spec.kind, spec.name.clone(), spec.provider.clone(), created.id)
        .with_attributes(record_attrs)
        .with_depends_on(spec.depends_on.clone());
    resolved.insert(spec.name.clone(), live.clone());
    state.insert(record);

    publish_exports(spec, &live, exports)
}

fn publish_exports(
    spec: &ResourceSpec,
    attributes: &Attributes,
    exports: &ExportStore,
) -> Result<(), ApplyError> {
    for (export_key, attribute) in &spec.exports {
        match attributes.get(attribute) {
            Some(value) => exports.publish(export_key.clone(), value_to_string(value))?,
            None => {
                tracing::warn!(
                    resource = %spec.key(),
                    export = %export_key,
                    attribute = %attribute,
                    "export attribute not present, skipping"
                );
            }
        }
    }
    Ok(())
}

fn lookup<'a>(
    registry: &'a ProviderRegistry,
    name: &str,
) -> Result<&'a std::sync::Arc<dyn crate::provider::Provider>, ApplyError> {
    registry
        .get(name)
        .ok_or_else(|| ApplyError::UnknownProvider(name.to_string()))
}

fn provider_name(
    op: &Operation,
    desired: &DesiredState,
    state: &ObservedState,
) -> Option<String> {
    desired
        .get(&op.key)
        .map(|s| s.provider.clone())
        .or_else(|| state.get(&op.key).map(|r| r.provider.clone()))
}

/// Attributes of a record as seen by placeholder resolution, with the
/// provider id exposed as `id`.
fn record_context(record: &ResourceRecord) -> Attributes {
    let mut attrs = record.attributes.clone();
    attrs.insert("id".to_string(), serde_json::Value::String(record.id.clone()));
    attrs
}

fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Expand `${resource-name.attribute}` placeholders in string
/// attributes against already-applied resources. A value that is
/// exactly one placeholder keeps the referenced value's JSON type.
fn resolve_attributes(
    resource: &ResourceKey,
    attributes: &Attributes,
    resolved: &BTreeMap<String, Attributes>,
) -> Result<Attributes, ApplyError> {
    let mut out = Attributes::new();
    for (field, value) in attributes {
        out.insert(field.clone(), resolve_value(resource, value, resolved)?);
    }
    Ok(out)
}

fn resolve_value(
    resource: &ResourceKey,
    value: &serde_json::Value,
    resolved: &BTreeMap<String, Attributes>,
) -> Result<serde_json::Value, ApplyError> {
    let serde_json::Value::String(s) = value else {
        return Ok(value.clone());
    };
    if !s.contains("${") {
        return Ok(value.clone());
    }

    let lookup_ref = |name: &str, attr: &str, whole: &str| {
        resolved
            .get(name)
            .and_then(|attrs| attrs.get(attr))
            .cloned()
            .ok_or_else(|| ApplyError::UnresolvedReference {
                resource: resource.clone(),
                reference: whole.to_string(),
            })
    };

    // Whole-value placeholder: keep the referenced type.
    if let Some(caps) = PLACEHOLDER.captures(s) {
        if let (Some(whole), Some(name), Some(attr)) = (caps.get(0), caps.get(1), caps.get(2)) {
            if whole.as_str() == s {
                return lookup_ref(name.as_str(), attr.as_str(), whole.as_str());
            }
        }
    }

    let mut rendered = String::new();
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(s) {
        let (Some(whole), Some(name), Some(attr)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        rendered.push_str(&s[last..whole.start()]);
        let referenced = lookup_ref(name.as_str(), attr.as_str(), whole.as_str())?;
        rendered.push_str(&value_to_string(&referenced));
        last = whole.end();
    }
    rendered.push_str(&s[last..]);
    Ok(serde_json::Value::String(rendered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::plan;
    use crate::provider::{CreatedResource, Provider, ProviderError};
    use crate::resource::{GlobalSettings, ResourceKind, ResourceSpec};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// Adapter double: records every call, optionally failing on one
    /// resource, and hands out canned attributes on create.
    struct MockProvider {
        name: String,
        calls: Mutex<Vec<String>>,
        fail_on: Option<String>,
        created_attrs: BTreeMap<String, Attributes>,
    }

    impl MockProvider {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                calls: Mutex::new(Vec::new()),
                fail_on: None,
                created_attrs: BTreeMap::new(),
            }
        }

        fn failing_on(mut self, name: &str) -> Self {
            self.fail_on = Some(name.to_string());
            self
        }

        fn returning(mut self, resource: &str, attrs: Attributes) -> Self {
            self.created_attrs.insert(resource.to_string(), attrs);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Provider for MockProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn create(&self, spec: &ResourceSpec) -> Result<CreatedResource, ProviderError> {
            if self.fail_on.as_deref() == Some(spec.name.as_str()) {
                return Err(ProviderError::new("boom"));
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("create {}", spec.key()));
            let mut created = CreatedResource::new(format!("id-{}", spec.name));
            if let Some(attrs) = self.created_attrs.get(&spec.name) {
                created.attributes = attrs.clone();
            }
            // Echo the resolved address back so tests can inspect it.
            if let Some(address) = spec.attributes.get("address") {
                created
                    .attributes
                    .insert("applied_address".to_string(), address.clone());
            }
            Ok(created)
        }

        async fn read(
            &self,
            _kind: ResourceKind,
            _name: &str,
        ) -> Result<Option<Attributes>, ProviderError> {
            Ok(None)
        }

        async fn update(
            &self,
            kind: ResourceKind,
            name: &str,
            _changes: &Attributes,
        ) -> Result<(), ProviderError> {
            if self.fail_on.as_deref() == Some(name) {
                return Err(ProviderError::new("boom"));
            }
            self.calls
                .lock()
                .unwrap()
                .push(format!("update {}:{}", kind, name));
            Ok(())
        }

        async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), ProviderError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("delete {}:{}", kind, name));
            Ok(())
        }
    }

    fn vm(name: &str) -> ResourceSpec {
        ResourceSpec::new(ResourceKind::Vm, name, "mock")
    }

    fn desired(specs: Vec<ResourceSpec>) -> DesiredState {
        let mut builder = DesiredState::builder(GlobalSettings::default());
        for spec in specs {
            builder = builder.resource(spec);
        }
        builder.build().unwrap()
    }

    fn registry(provider: &Arc<MockProvider>) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry.register(provider.clone() as Arc<dyn Provider>);
        registry
    }

    async fn run(
        state: DesiredState,
        provider: Arc<MockProvider>,
        options: ApplyOptions,
    ) -> (ApplyReport, ObservedState, ExportStore) {
        let mut observed = ObservedState::new();
        let exports = ExportStore::new();
        let the_plan = plan(&state, &observed).unwrap();
        let report = apply(
            &the_plan,
            &state,
            &mut observed,
            &registry(&provider),
            &exports,
            &options,
        )
        .await
        .unwrap();
        (report, observed, exports)
    }

    #[tokio::test]
    async fn creates_run_in_dependency_order() {
        let provider = Arc::new(MockProvider::new("mock"));
        let state = desired(vec![vm("b").depends_on("a"), vm("a")]);

        let (report, observed, _) = run(state, provider.clone(), ApplyOptions::default()).await;

        assert!(report.is_success());
        assert_eq!(provider.calls(), vec!["create vm:a", "create vm:b"]);
        assert_eq!(
            observed
                .get(&ResourceKey::new(ResourceKind::Vm, "a"))
                .unwrap()
                .id,
            "id-a"
        );
    }

    #[tokio::test]
    async fn fail_fast_reports_applied_failed_and_not_attempted() {
        let provider = Arc::new(MockProvider::new("mock").failing_on("b"));
        let state = desired(vec![
            vm("a"),
            vm("b").depends_on("a"),
            vm("c").depends_on("b"),
        ]);

        let (report, observed, _) = run(state, provider.clone(), ApplyOptions::default()).await;

        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.failed[0].key, ResourceKey::new(ResourceKind::Vm, "b"));
        assert_eq!(report.skipped[0].key, ResourceKey::new(ResourceKind::Vm, "c"));
        // The applied prefix stays in state for the next run to pick up.
        assert!(observed.get(&ResourceKey::new(ResourceKind::Vm, "a")).is_some());
        assert!(observed.get(&ResourceKey::new(ResourceKind::Vm, "b")).is_none());
    }

    #[tokio::test]
    async fn continue_on_error_still_applies_independent_branches() {
        let provider = Arc::new(MockProvider::new("mock").failing_on("a"));
        let state = desired(vec![vm("a"), vm("b").depends_on("a"), vm("c")]);

        let options = ApplyOptions {
            continue_on_error: true,
            ..Default::default()
        };
        let (report, _, _) = run(state, provider.clone(), options).await;

        assert_eq!(report.failed.len(), 1);
        // b is a dependent of the failure, c is independent.
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].key.name, "b");
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.applied[0].key.name, "c");
    }

    #[tokio::test]
    async fn destructive_plan_is_refused_before_any_provider_call() {
        let provider = Arc::new(MockProvider::new("mock"));
        let spec = vm("a").with_attribute("template_vmid", 9001);
        let state = desired(vec![spec]);

        let mut observed = ObservedState::new();
        observed.insert(
            ResourceRecord::new(ResourceKind::Vm, "a", "mock", "1")
                .with_attribute("template_vmid", json!(9000)),
        );

        let the_plan = plan(&state, &observed).unwrap();
        assert!(the_plan.requires_confirmation());

        let err = apply(
            &the_plan,
            &state,
            &mut observed,
            &registry(&provider),
            &ExportStore::new(),
            &ApplyOptions::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ApplyError::DestructiveNotApproved(_)));
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn approved_replace_deletes_then_recreates() {
        let provider = Arc::new(MockProvider::new("mock"));
        let spec = vm("a").with_attribute("template_vmid", 9001);
        let state = desired(vec![spec]);

        let mut observed = ObservedState::new();
        observed.insert(
            ResourceRecord::new(ResourceKind::Vm, "a", "mock", "1")
                .with_attribute("template_vmid", json!(9000)),
        );

        let the_plan = plan(&state, &observed).unwrap();
        let options = ApplyOptions {
            approve_destructive: true,
            ..Default::default()
        };
        let report = apply(
            &the_plan,
            &state,
            &mut observed,
            &registry(&provider),
            &ExportStore::new(),
            &options,
        )
        .await
        .unwrap();

        assert!(report.is_success());
        assert_eq!(provider.calls(), vec!["delete vm:a", "create vm:a"]);
        assert_eq!(
            observed
                .get(&ResourceKey::new(ResourceKind::Vm, "a"))
                .unwrap()
                .id,
            "id-a"
        );
    }

    #[tokio::test]
    async fn placeholders_resolve_from_applied_dependencies() {
        let provider = Arc::new(MockProvider::new("mock").returning(
            "edge-node",
            Attributes::from([("private_ip".to_string(), json!("192.168.128.10"))]),
        ));
        let backend = ResourceSpec::new(ResourceKind::LbNode, "edge-backend-https", "mock")
            .with_attribute("address", "${edge-node.private_ip}:443")
            .depends_on("edge-node");
        let state = desired(vec![vm("edge-node"), backend]);

        let (report, observed, _) = run(state, provider.clone(), ApplyOptions::default()).await;

        assert!(report.is_success());
        let record = observed
            .get(&ResourceKey::new(ResourceKind::LbNode, "edge-backend-https"))
            .unwrap();
        assert_eq!(
            record.get_attribute::<String>("applied_address").as_deref(),
            Some("192.168.128.10:443")
        );
    }

    #[tokio::test]
    async fn replan_after_placeholder_apply_converges_to_noop() {
        let provider = Arc::new(MockProvider::new("mock").returning(
            "edge-node",
            Attributes::from([("private_ip".to_string(), json!("192.168.128.10"))]),
        ));
        let backend = ResourceSpec::new(ResourceKind::LbNode, "edge-backend-https", "mock")
            .with_attribute("address", "${edge-node.private_ip}:443")
            .depends_on("edge-node");
        let state = desired(vec![vm("edge-node"), backend]);

        let (report, observed, _) =
            run(state.clone(), provider.clone(), ApplyOptions::default()).await;
        assert!(report.is_success());

        // The record keeps the address as declared, so the next plan
        // sees no drift on the placeholder field.
        let second = plan(&state, &observed).unwrap();
        assert!(!second.has_changes, "expected all no-op, got {:?}", second.operations);
    }

    #[tokio::test]
    async fn unresolvable_placeholder_fails_the_operation() {
        let provider = Arc::new(MockProvider::new("mock"));
        let state = desired(vec![
            vm("a").with_attribute("address", "${a.never_returned}:80"),
        ]);

        let (report, _, _) = run(state, provider.clone(), ApplyOptions::default()).await;

        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].error.contains("never_returned"));
    }

    #[tokio::test]
    async fn exports_are_published_from_created_attributes() {
        let provider = Arc::new(MockProvider::new("mock").returning(
            "edge-node",
            Attributes::from([("ip_address".to_string(), json!("203.0.113.10"))]),
        ));
        let state = desired(vec![vm("edge-node").export("edgeNodeIP", "ip_address")]);

        let (report, _, exports) = run(state, provider.clone(), ApplyOptions::default()).await;

        assert!(report.is_success());
        assert_eq!(exports.get("edgeNodeIP").as_deref(), Some("203.0.113.10"));
    }

    #[tokio::test]
    async fn noop_republishes_exports_from_observed_state() {
        let provider = Arc::new(MockProvider::new("mock"));
        let spec = vm("edge-node")
            .with_attribute("cores", 1)
            .export("edgeNodeIP", "ip_address");
        let state = desired(vec![spec.clone()]);

        let mut observed = ObservedState::new();
        observed.insert(
            ResourceRecord::new(ResourceKind::Vm, "edge-node", "mock", "7")
                .with_attribute("cores", json!(1))
                .with_attribute("ip_address", json!("203.0.113.10")),
        );

        let the_plan = plan(&state, &observed).unwrap();
        assert!(!the_plan.has_changes);

        let exports = ExportStore::new();
        let report = apply(
            &the_plan,
            &state,
            &mut observed,
            &registry(&provider),
            &exports,
            &ApplyOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(report.unchanged, 1);
        assert!(provider.calls().is_empty());
        assert_eq!(exports.get("edgeNodeIP").as_deref(), Some("203.0.113.10"));
    }

    #[tokio::test]
    async fn dependency_cycle_never_reaches_the_adapter() {
        let provider = Arc::new(MockProvider::new("mock"));
        let state = desired(vec![vm("a").depends_on("b"), vm("b").depends_on("a")]);

        assert!(plan(&state, &ObservedState::new()).is_err());
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn conflicting_exports_halt_the_run() {
        let provider = Arc::new(
            MockProvider::new("mock")
                .returning("a", Attributes::from([("ip".to_string(), json!("10.0.0.1"))]))
                .returning("b", Attributes::from([("ip".to_string(), json!("10.0.0.2"))])),
        );
        let state = desired(vec![
            vm("a").export("clusterIP", "ip"),
            vm("b").export("clusterIP", "ip"),
            vm("c"),
        ]);

        let options = ApplyOptions {
            continue_on_error: true,
            ..Default::default()
        };
        let (report, _, _) = run(state, provider.clone(), options).await;

        // Export conflicts are fatal even under continue_on_error.
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].key.name, "b");
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].key.name, "c");
    }
}
