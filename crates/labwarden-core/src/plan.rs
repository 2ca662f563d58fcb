//! Diff/plan engine
//!
//! Pure and synchronous: compares a [`DesiredState`] against an
//! [`ObservedState`] and emits an ordered [`Plan`]. No provider is ever
//! called from here, so a bad plan can never touch real infrastructure.
//!
//! Ordering rules:
//! - Create/Update follow the dependency partial order (a dependency's
//!   operation precedes its dependents'), ties broken by name.
//! - Deletes come last, in reverse dependency order.
//! - A changed immutable field turns the operation into a destructive
//!   `Replace`, which the caller must explicitly approve before apply.

use crate::error::PlanError;
use crate::resource::{DesiredState, ResourceKey, ResourceSpec};
use crate::state::{ObservedState, ResourceRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What to do with a single resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Create,
    Update,
    /// Delete then re-create; required when an immutable field changed.
    Replace,
    Delete,
    NoOp,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Create => write!(f, "create"),
            OpKind::Update => write!(f, "update"),
            OpKind::Replace => write!(f, "replace"),
            OpKind::Delete => write!(f, "delete"),
            OpKind::NoOp => write!(f, "no-op"),
        }
    }
}

/// Before/after values of one changed attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub from: Option<serde_json::Value>,
    pub to: Option<serde_json::Value>,
}

/// One step of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub op: OpKind,

    pub key: ResourceKey,

    /// Changed attributes (Update/Replace only).
    pub diff: BTreeMap<String, FieldChange>,

    /// Destructive operations replace a live resource and require
    /// explicit approval.
    pub destructive: bool,
}

impl Operation {
    fn new(op: OpKind, key: ResourceKey) -> Self {
        Self {
            op,
            key,
            diff: BTreeMap::new(),
            destructive: false,
        }
    }
}

/// Ordered change-set produced by [`plan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub operations: Vec<Operation>,

    pub has_changes: bool,
}

impl Plan {
    pub fn new(operations: Vec<Operation>) -> Self {
        let has_changes = operations.iter().any(|o| o.op != OpKind::NoOp);
        Self {
            operations,
            has_changes,
        }
    }

    pub fn empty() -> Self {
        Self {
            operations: Vec::new(),
            has_changes: false,
        }
    }

    /// True when the plan contains a destructive replace the caller has
    /// to approve first.
    pub fn requires_confirmation(&self) -> bool {
        self.operations.iter().any(|o| o.destructive)
    }

    pub fn destructive_operations(&self) -> Vec<&Operation> {
        self.operations.iter().filter(|o| o.destructive).collect()
    }

    pub fn operations_of(&self, op: OpKind) -> Vec<&Operation> {
        self.operations.iter().filter(|o| o.op == op).collect()
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            create: self.operations_of(OpKind::Create).len(),
            update: self.operations_of(OpKind::Update).len(),
            replace: self.operations_of(OpKind::Replace).len(),
            delete: self.operations_of(OpKind::Delete).len(),
            no_change: self.operations_of(OpKind::NoOp).len(),
        }
    }
}

/// Counts per operation kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub delete: usize,
    pub no_change: usize,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            self.create, self.update, self.replace, self.delete, self.no_change
        )
    }
}

/// Compute the ordered change-set that moves `observed` to `desired`.
pub fn plan(desired: &DesiredState, observed: &ObservedState) -> Result<Plan, PlanError> {
    let ordered = topo_sort_specs(desired.resources())?;

    let mut operations = Vec::with_capacity(ordered.len());
    for spec in &ordered {
        operations.push(diff_resource(spec, observed.get(&spec.key())));
    }

    // Orphans: observed but no longer desired. Deleted in reverse
    // dependency order so dependents go before their dependencies.
    let orphans: Vec<&ResourceRecord> = observed
        .records()
        .filter(|r| !desired.contains(&r.key()))
        .filter(|r| {
            if r.protected {
                tracing::debug!(resource = %r.key(), "skipping protected orphan");
            }
            !r.protected
        })
        .collect();

    for record in topo_sort_orphans(&orphans)?.into_iter().rev() {
        operations.push(Operation::new(OpKind::Delete, record.key()));
    }

    let plan = Plan::new(operations);
    tracing::debug!(summary = %plan.summary(), "computed plan");
    Ok(plan)
}

fn diff_resource(spec: &ResourceSpec, record: Option<&ResourceRecord>) -> Operation {
    let Some(record) = record else {
        return Operation::new(OpKind::Create, spec.key());
    };

    // Field-by-field over the declared attributes. Provider-reported
    // extras (assigned IPs, hostnames) never count as drift.
    let mut diff = BTreeMap::new();
    for (field, desired_value) in &spec.attributes {
        let observed_value = record.attributes.get(field);
        if observed_value != Some(desired_value) {
            diff.insert(
                field.clone(),
                FieldChange {
                    from: observed_value.cloned(),
                    to: Some(desired_value.clone()),
                },
            );
        }
    }

    if diff.is_empty() {
        return Operation::new(OpKind::NoOp, spec.key());
    }

    let immutable_changed = spec
        .kind
        .immutable_fields()
        .iter()
        .any(|f| diff.contains_key(*f));

    let mut op = if immutable_changed {
        let mut op = Operation::new(OpKind::Replace, spec.key());
        op.destructive = true;
        op
    } else {
        Operation::new(OpKind::Update, spec.key())
    };
    op.diff = diff;
    op
}

/// Kahn's algorithm over the desired specs. Ready resources are drained
/// in (name, kind) order so the output is deterministic.
fn topo_sort_specs(specs: &[ResourceSpec]) -> Result<Vec<ResourceSpec>, PlanError> {
    let mut by_name: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, spec) in specs.iter().enumerate() {
        by_name.entry(spec.name.as_str()).or_default().push(i);
    }

    let mut indegree = vec![0usize; specs.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
    for (i, spec) in specs.iter().enumerate() {
        for dep in &spec.depends_on {
            for &d in by_name.get(dep.as_str()).map(Vec::as_slice).unwrap_or(&[]) {
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let mut ready: BTreeSet<(&str, crate::resource::ResourceKind, usize)> = specs
        .iter()
        .enumerate()
        .filter(|(i, _)| indegree[*i] == 0)
        .map(|(i, s)| (s.name.as_str(), s.kind, i))
        .collect();

    let mut order = Vec::with_capacity(specs.len());
    while let Some(&entry) = ready.iter().next() {
        ready.remove(&entry);
        let (_, _, i) = entry;
        order.push(specs[i].clone());
        for &dep in &dependents[i] {
            indegree[dep] -= 1;
            if indegree[dep] == 0 {
                ready.insert((specs[dep].name.as_str(), specs[dep].kind, dep));
            }
        }
    }

    if order.len() < specs.len() {
        let mut stuck: Vec<String> = specs
            .iter()
            .enumerate()
            .filter(|(i, _)| indegree[*i] > 0)
            .map(|(_, s)| s.key().to_string())
            .collect();
        stuck.sort();
        return Err(PlanError::CircularDependency(stuck.join(", ")));
    }

    Ok(order)
}

/// Dependency order among orphaned records, using the dependency names
/// captured when they were applied (edges to non-orphans are ignored).
fn topo_sort_orphans<'a>(
    orphans: &[&'a ResourceRecord],
) -> Result<Vec<&'a ResourceRecord>, PlanError> {
    let mut by_name: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, record) in orphans.iter().enumerate() {
        by_name.entry(record.name.as_str()).or_default().push(i);
    }

    let mut indegree = vec![0usize; orphans.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); orphans.len()];
    for (i, record) in orphans.iter().enumerate() {
        for dep in &record.depends_on {
            for &d in by_name.get(dep.as_str()).map(Vec::as_slice).unwrap_or(&[]) {
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let mut ready: BTreeSet<(&str, crate::resource::ResourceKind, usize)> = orphans
        .iter()
        .enumerate()
        .filter(|(i, _)| indegree[*i] == 0)
        .map(|(i, r)| (r.name.as_str(), r.kind, i))
        .collect();

    let mut order = Vec::with_capacity(orphans.len());
    while let Some(&entry) = ready.iter().next() {
        ready.remove(&entry);
        let (_, _, i) = entry;
        order.push(orphans[i]);
        for &dep in &dependents[i] {
            indegree[dep] -= 1;
            if indegree[dep] == 0 {
                ready.insert((orphans[dep].name.as_str(), orphans[dep].kind, dep));
            }
        }
    }

    if order.len() < orphans.len() {
        let mut stuck: Vec<String> = orphans
            .iter()
            .enumerate()
            .filter(|(i, _)| indegree[*i] > 0)
            .map(|(_, r)| r.key().to_string())
            .collect();
        stuck.sort();
        return Err(PlanError::CircularDependency(stuck.join(", ")));
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{GlobalSettings, ResourceKind, ResourceSpec};
    use crate::state::ResourceRecord;
    use serde_json::json;

    fn vm(name: &str) -> ResourceSpec {
        ResourceSpec::new(ResourceKind::Vm, name, "proxmox")
    }

    fn desired(specs: Vec<ResourceSpec>) -> DesiredState {
        let mut builder = DesiredState::builder(GlobalSettings::default());
        for spec in specs {
            builder = builder.resource(spec);
        }
        builder.build().unwrap()
    }

    fn record_for(spec: &ResourceSpec) -> ResourceRecord {
        ResourceRecord::new(spec.kind, spec.name.clone(), spec.provider.clone(), "1")
            .with_attributes(spec.attributes.clone())
            .with_depends_on(spec.depends_on.clone())
    }

    #[test]
    fn empty_observed_yields_creates_in_dependency_order() {
        let state = desired(vec![vm("b").depends_on("a"), vm("a")]);
        let plan = plan(&state, &ObservedState::new()).unwrap();

        let ops: Vec<(OpKind, &str)> = plan
            .operations
            .iter()
            .map(|o| (o.op, o.key.name.as_str()))
            .collect();
        assert_eq!(ops, vec![(OpKind::Create, "a"), (OpKind::Create, "b")]);
    }

    #[test]
    fn matching_observed_yields_all_noop() {
        let a = vm("a").with_attribute("cores", 2);
        let b = vm("b").with_attribute("cores", 4).depends_on("a");
        let mut observed = ObservedState::new();
        observed.insert(record_for(&a));
        observed.insert(record_for(&b));

        let plan = plan(&desired(vec![a, b]), &observed).unwrap();
        assert!(!plan.has_changes);
        assert_eq!(plan.summary().no_change, 2);
    }

    #[test]
    fn plan_is_deterministic() {
        let build = || {
            desired(vec![
                vm("c").depends_on("a"),
                vm("b").depends_on("a"),
                vm("a"),
                vm("d"),
            ])
        };
        let first = plan(&build(), &ObservedState::new()).unwrap();
        let second = plan(&build(), &ObservedState::new()).unwrap();

        let names = |p: &Plan| -> Vec<String> {
            p.operations.iter().map(|o| o.key.name.clone()).collect()
        };
        assert_eq!(names(&first), names(&second));
        // "a" unblocks "b" and "c", which sort before "d" in the ready
        // set; everything drains in name order from there.
        assert_eq!(names(&first), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn changed_field_yields_update_with_minimal_diff() {
        let was = vm("a").with_attribute("cores", 2).with_attribute("memory_mb", 4096);
        let now = vm("a").with_attribute("cores", 4).with_attribute("memory_mb", 4096);

        let mut observed = ObservedState::new();
        observed.insert(record_for(&was));

        let plan = plan(&desired(vec![now]), &observed).unwrap();
        let op = &plan.operations[0];
        assert_eq!(op.op, OpKind::Update);
        assert_eq!(op.diff.len(), 1);
        let change = op.diff.get("cores").unwrap();
        assert_eq!(change.from, Some(json!(2)));
        assert_eq!(change.to, Some(json!(4)));
    }

    #[test]
    fn provider_reported_extras_are_not_drift() {
        let spec = vm("a").with_attribute("cores", 2);
        let mut observed = ObservedState::new();
        observed.insert(record_for(&spec).with_attribute("mac_address", json!("aa:bb")));

        let plan = plan(&desired(vec![spec]), &observed).unwrap();
        assert!(!plan.has_changes);
    }

    #[test]
    fn immutable_field_change_becomes_destructive_replace() {
        let was = vm("a").with_attribute("template_vmid", 9000);
        let now = vm("a").with_attribute("template_vmid", 9001);

        let mut observed = ObservedState::new();
        observed.insert(record_for(&was));

        let plan = plan(&desired(vec![now]), &observed).unwrap();
        let op = &plan.operations[0];
        assert_eq!(op.op, OpKind::Replace);
        assert!(op.destructive);
        assert!(plan.requires_confirmation());
    }

    #[test]
    fn orphan_yields_single_delete() {
        let mut observed = ObservedState::new();
        observed.insert(record_for(&vm("gone")));

        let plan = plan(&desired(vec![vm("a")]), &observed).unwrap();
        let deletes = plan.operations_of(OpKind::Delete);
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].key.name, "gone");
    }

    #[test]
    fn protected_orphan_is_left_alone() {
        let mut observed = ObservedState::new();
        observed.insert(record_for(&vm("keep")).protected());

        let plan = plan(&desired(vec![]), &observed).unwrap();
        assert!(plan.operations.is_empty());
    }

    #[test]
    fn orphans_deleted_in_reverse_dependency_order() {
        let mut observed = ObservedState::new();
        observed.insert(record_for(&vm("base")));
        observed.insert(record_for(&vm("app").depends_on("base")));

        let plan = plan(&desired(vec![]), &observed).unwrap();
        let names: Vec<&str> = plan
            .operations
            .iter()
            .map(|o| o.key.name.as_str())
            .collect();
        assert_eq!(names, vec!["app", "base"]);
    }

    #[test]
    fn cycle_is_a_plan_error() {
        let state = desired(vec![vm("a").depends_on("b"), vm("b").depends_on("a")]);
        let err = plan(&state, &ObservedState::new()).unwrap_err();
        let PlanError::CircularDependency(stuck) = err;
        assert!(stuck.contains("vm:a"));
        assert!(stuck.contains("vm:b"));
    }

    #[test]
    fn replan_after_apply_converges_to_noop() {
        // Simulates the idempotence contract: planning against a state
        // equal to the prior run's result yields no changes.
        let specs = vec![vm("a").with_attribute("cores", 2), vm("b").depends_on("a")];
        let state = desired(specs.clone());

        let first = plan(&state, &ObservedState::new()).unwrap();
        assert_eq!(first.summary().create, 2);

        let mut observed = ObservedState::new();
        for spec in &specs {
            observed.insert(record_for(spec));
        }
        let second = plan(&state, &observed).unwrap();
        assert!(!second.has_changes);
    }
}
