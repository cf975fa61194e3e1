//! Dependency resolution and load ordering.
//!
//! Resolution is a pure function of the manifest set: a fresh
//! [`DependencyGraph`] is built every time and the result lists the load
//! order of every mod that can load plus an issue for every mod that cannot.
//! Failures are scoped: a blocked mod only takes its dependents down with it.

use crate::diagnostic::Severity;
use crate::error::{ErrorKind, RuntimeError};
use crate::manifest::ModManifest;
use crate::version::Version;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// A problem found during resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolveIssue {
    /// The mod the issue belongs to.
    pub mod_id: String,
    pub severity: Severity,
    /// Error classification; `None` for warnings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    pub message: String,
    /// Other mods involved; for cycles, the chain in dependency order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<String>,
}

impl ResolveIssue {
    fn error(mod_id: &str, error: RuntimeError, related: Vec<String>) -> Self {
        Self {
            mod_id: mod_id.to_string(),
            severity: Severity::Error,
            kind: Some(error.kind()),
            message: error.to_string(),
            related,
        }
    }

    fn warning(mod_id: &str, message: String) -> Self {
        Self {
            mod_id: mod_id.to_string(),
            severity: Severity::Warning,
            kind: None,
            message,
            related: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Ordering edges between mods, keyed by id.
///
/// An edge `dependency -> dependent` means the dependency loads first.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    dependencies: BTreeMap<String, BTreeSet<String>>,
    dependents: BTreeMap<String, BTreeSet<String>>,
    required: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    fn add_node(&mut self, id: &str) {
        self.dependencies.entry(id.to_string()).or_default();
        self.dependents.entry(id.to_string()).or_default();
        self.required.entry(id.to_string()).or_default();
    }

    fn add_edge(&mut self, dependency: &str, dependent: &str, required: bool) {
        self.dependencies
            .entry(dependent.to_string())
            .or_default()
            .insert(dependency.to_string());
        self.dependents
            .entry(dependency.to_string())
            .or_default()
            .insert(dependent.to_string());
        if required {
            self.required
                .entry(dependent.to_string())
                .or_default()
                .insert(dependency.to_string());
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.dependencies.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.dependencies.keys().map(String::as_str)
    }

    /// Present dependencies (required and optional) of a mod.
    pub fn dependencies_of(&self, id: &str) -> impl Iterator<Item = &str> {
        self.dependencies
            .get(id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Present required dependencies of a mod.
    pub fn required_of(&self, id: &str) -> impl Iterator<Item = &str> {
        self.required.get(id).into_iter().flatten().map(String::as_str)
    }

    /// Direct dependents of a mod.
    pub fn dependents_of(&self, id: &str) -> impl Iterator<Item = &str> {
        self.dependents
            .get(id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Every mod that directly or indirectly depends on `id`.
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = self.dependents_of(id).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.to_string()) {
                stack.extend(self.dependents_of(next));
            }
        }
        seen.remove(id);
        seen
    }

    /// Kahn's algorithm over `nodes`, ignoring edges that leave the set.
    /// Ties are broken by `rank`. Returns the order and the nodes that could
    /// not be placed.
    fn kahn<F>(
        &self,
        nodes: &BTreeSet<String>,
        extra: &[(String, String)],
        rank: F,
    ) -> (Vec<String>, BTreeSet<String>)
    where
        F: Fn(&str) -> usize,
    {
        let mut in_degree: HashMap<&str, usize> = nodes.iter().map(|n| (n.as_str(), 0)).collect();
        let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();

        let edges = nodes
            .iter()
            .flat_map(|n| self.dependencies_of(n).map(move |d| (d, n.as_str())))
            .chain(extra.iter().map(|(a, b)| (a.as_str(), b.as_str())));
        for (from, to) in edges {
            if nodes.contains(from) && nodes.contains(to) {
                outgoing.entry(from).or_default().push(to);
                if let Some(d) = in_degree.get_mut(to) {
                    *d += 1;
                }
            }
        }

        let mut ready: BTreeSet<(usize, &str)> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| (rank(*n), *n))
            .collect();
        let mut order = Vec::with_capacity(nodes.len());

        while let Some(first) = ready.pop_first() {
            let (_, node) = first;
            order.push(node.to_string());
            for next in outgoing.get(node).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert((rank(*next), *next));
                    }
                }
            }
        }

        let placed: BTreeSet<&str> = order.iter().map(String::as_str).collect();
        let leftover = nodes
            .iter()
            .filter(|n| !placed.contains(n.as_str()))
            .cloned()
            .collect();
        (order, leftover)
    }

    /// Strongly connected components among `nodes` with more than one
    /// member, each sorted.
    fn cycles(&self, nodes: &BTreeSet<String>) -> Vec<BTreeSet<String>> {
        struct Tarjan<'a> {
            graph: &'a DependencyGraph,
            nodes: &'a BTreeSet<String>,
            index: usize,
            indices: HashMap<&'a str, usize>,
            low: HashMap<&'a str, usize>,
            stack: Vec<&'a str>,
            on_stack: BTreeSet<&'a str>,
            components: Vec<BTreeSet<String>>,
        }

        impl<'a> Tarjan<'a> {
            fn visit(&mut self, v: &'a str) {
                self.indices.insert(v, self.index);
                self.low.insert(v, self.index);
                self.index += 1;
                self.stack.push(v);
                self.on_stack.insert(v);

                let graph = self.graph;
                for w in graph.dependencies_of(v) {
                    if !self.nodes.contains(w) {
                        continue;
                    }
                    if !self.indices.contains_key(w) {
                        self.visit(w);
                        let low = self.low[v].min(self.low[w]);
                        self.low.insert(v, low);
                    } else if self.on_stack.contains(w) {
                        let low = self.low[v].min(self.indices[w]);
                        self.low.insert(v, low);
                    }
                }

                if self.low[v] == self.indices[v] {
                    let mut component = BTreeSet::new();
                    while let Some(w) = self.stack.pop() {
                        self.on_stack.remove(w);
                        component.insert(w.to_string());
                        if w == v {
                            break;
                        }
                    }
                    if component.len() > 1 {
                        self.components.push(component);
                    }
                }
            }
        }

        let mut tarjan = Tarjan {
            graph: self,
            nodes,
            index: 0,
            indices: HashMap::new(),
            low: HashMap::new(),
            stack: Vec::new(),
            on_stack: BTreeSet::new(),
            components: Vec::new(),
        };
        for node in nodes {
            if !tarjan.indices.contains_key(node.as_str()) {
                tarjan.visit(node);
            }
        }
        let mut components = tarjan.components;
        components.sort();
        components
    }

    /// A cycle through `component`, starting at its smallest member and
    /// following dependency edges, preferring the smallest next id.
    fn cycle_chain(&self, component: &BTreeSet<String>) -> Vec<String> {
        let Some(start) = component.first() else {
            return Vec::new();
        };

        fn walk(
            graph: &DependencyGraph,
            component: &BTreeSet<String>,
            start: &str,
            path: &mut Vec<String>,
        ) -> bool {
            let Some(current) = path.last().cloned() else {
                return false;
            };
            for next in graph.dependencies_of(&current) {
                if next == start {
                    return true;
                }
                if component.contains(next) && !path.iter().any(|p| p == next) {
                    path.push(next.to_string());
                    if walk(graph, component, start, path) {
                        return true;
                    }
                    path.pop();
                }
            }
            false
        }

        let mut path = vec![start.clone()];
        if walk(self, component, start, &mut path) {
            path
        } else {
            component.iter().cloned().collect()
        }
    }

    /// Whether `to` is reachable from `from` over graph and extra edges.
    fn reaches(&self, from: &str, to: &str, extra: &[(String, String)]) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack = vec![from.to_string()];
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if !seen.insert(node.clone()) {
                continue;
            }
            stack.extend(self.dependents_of(&node).map(str::to_string));
            stack.extend(
                extra
                    .iter()
                    .filter(|(a, _)| *a == node)
                    .map(|(_, b)| b.clone()),
            );
        }
        false
    }
}

/// Outcome of resolving a manifest set.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Mods that can load, in load order.
    pub order: Vec<String>,

    /// Blocked mods with the first reason each was blocked.
    pub failed: BTreeMap<String, ResolveIssue>,

    /// Every error and warning, in detection order.
    pub issues: Vec<ResolveIssue>,

    /// Edges between all distinct discovered mods.
    pub graph: DependencyGraph,
}

impl Resolution {
    pub fn is_clean(&self) -> bool {
        !self.issues.iter().any(ResolveIssue::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ResolveIssue> {
        self.issues.iter().filter(|i| i.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ResolveIssue> {
        self.issues.iter().filter(|i| !i.is_error())
    }

    /// Position of a mod in the load order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|m| m == id)
    }
}

/// Builds load orders from manifests.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    host_api_version: Version,
}

impl DependencyResolver {
    pub fn new(host_api_version: Version) -> Self {
        Self { host_api_version }
    }

    pub fn host_api_version(&self) -> &Version {
        &self.host_api_version
    }

    /// Resolve manifests given in discovery priority order.
    pub fn resolve(&self, manifests: &[ModManifest]) -> Resolution {
        let mut resolution = Resolution::default();
        let mut mods: BTreeMap<&str, &ModManifest> = BTreeMap::new();

        for manifest in manifests {
            if mods.contains_key(manifest.id.as_str()) {
                warn!(mod_id = %manifest.id, "Duplicate mod id ignored");
                resolution.issues.push(ResolveIssue::error(
                    &manifest.id,
                    RuntimeError::DuplicateMod(manifest.id.clone()),
                    Vec::new(),
                ));
                continue;
            }
            mods.insert(&manifest.id, manifest);
        }

        let mut graph = DependencyGraph::default();
        let mut blocked: BTreeMap<String, ResolveIssue> = BTreeMap::new();

        let mut block = |resolution: &mut Resolution, id: &str, issue: ResolveIssue| {
            resolution.issues.push(issue.clone());
            blocked.entry(id.to_string()).or_insert(issue);
        };

        for (id, manifest) in &mods {
            graph.add_node(id);

            if !manifest.api_version.matches(&self.host_api_version) {
                let err = RuntimeError::DependencyIncompatible {
                    mod_id: id.to_string(),
                    other: "host".to_string(),
                    reason: format!(
                        "requires API {}, host provides {}",
                        manifest.api_version, self.host_api_version
                    ),
                };
                block(&mut resolution, id, ResolveIssue::error(id, err, Vec::new()));
            }

            for dep in &manifest.dependencies {
                let Some(target) = mods.get(dep.mod_id.as_str()) else {
                    if dep.optional {
                        resolution.issues.push(ResolveIssue::warning(
                            id,
                            format!("optional dependency '{}' is not installed", dep.mod_id),
                        ));
                    } else {
                        let err = RuntimeError::DependencyMissing {
                            mod_id: id.to_string(),
                            dependency: dep.mod_id.clone(),
                        };
                        block(
                            &mut resolution,
                            id,
                            ResolveIssue::error(id, err, vec![dep.mod_id.clone()]),
                        );
                    }
                    continue;
                };

                if !dep.accepts(&target.version) {
                    let reason = format!(
                        "requires version {}, found {}",
                        dep.version
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_default(),
                        target.version
                    );
                    if dep.optional {
                        resolution.issues.push(ResolveIssue::warning(
                            id,
                            format!("optional dependency '{}' ignored: {}", dep.mod_id, reason),
                        ));
                    } else {
                        let err = RuntimeError::DependencyIncompatible {
                            mod_id: id.to_string(),
                            other: dep.mod_id.clone(),
                            reason,
                        };
                        block(
                            &mut resolution,
                            id,
                            ResolveIssue::error(id, err, vec![dep.mod_id.clone()]),
                        );
                    }
                    continue;
                }

                graph.add_edge(&dep.mod_id, id, !dep.optional);
            }

            for other in &manifest.incompatible_with {
                if mods.contains_key(other.as_str()) {
                    let err = RuntimeError::DependencyIncompatible {
                        mod_id: id.to_string(),
                        other: other.clone(),
                        reason: "declared incompatible".to_string(),
                    };
                    block(
                        &mut resolution,
                        id,
                        ResolveIssue::error(id, err, vec![other.clone()]),
                    );
                }
            }
        }

        // Hard order over everything; leftovers contain the cycles.
        let all: BTreeSet<String> = mods.keys().map(|s| s.to_string()).collect();
        let (_, leftover) = graph.kahn(&all, &[], |_| 0);

        for component in graph.cycles(&leftover) {
            let chain = graph.cycle_chain(&component);
            let err = RuntimeError::DependencyCyclic {
                cycle: chain.clone(),
            };
            let first = chain.first().cloned().unwrap_or_default();
            let issue = ResolveIssue::error(&first, err, chain);
            warn!(cycle = %issue.message, "Dependency cycle detected");
            resolution.issues.push(issue.clone());
            for member in &component {
                blocked.entry(member.clone()).or_insert_with(|| ResolveIssue {
                    mod_id: member.clone(),
                    ..issue.clone()
                });
            }
        }

        // Propagate along required edges until nothing changes.
        loop {
            let mut newly = Vec::new();
            for id in &all {
                if blocked.contains_key(id) {
                    continue;
                }
                if let Some(dep) = graph.required_of(id).find(|d| blocked.contains_key(*d)) {
                    newly.push((id.clone(), dep.to_string()));
                }
            }
            if newly.is_empty() {
                break;
            }
            for (id, dep) in newly {
                let err = RuntimeError::DependencyFailed {
                    mod_id: id.clone(),
                    dependency: dep.clone(),
                };
                let issue = ResolveIssue::error(&id, err, vec![dep]);
                resolution.issues.push(issue.clone());
                blocked.insert(id, issue);
            }
        }

        // Required edges into blocked mods were propagated above.
        for id in &all {
            if blocked.contains_key(id) {
                continue;
            }
            for dep in graph.dependencies_of(id) {
                if blocked.contains_key(dep) {
                    resolution.issues.push(ResolveIssue::warning(
                        id,
                        format!("optional dependency '{}' failed to resolve", dep),
                    ));
                }
            }
        }

        let active: BTreeSet<String> = all
            .iter()
            .filter(|id| !blocked.contains_key(*id))
            .cloned()
            .collect();
        let (hard_order, _) = graph.kahn(&active, &[], |_| 0);
        let position: HashMap<&str, usize> = hard_order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let soft = self.soft_edges(&mods, &active, &graph, &mut resolution);
        let (order, _) = graph.kahn(&active, &soft, |id| {
            position.get(id).copied().unwrap_or(usize::MAX)
        });

        debug!(order = ?order, blocked = blocked.len(), "Resolved load order");
        resolution.order = order;
        resolution.failed = blocked;
        resolution.graph = graph;
        resolution
    }

    /// Accept `loadAfter`/`loadBefore` hints that keep the graph acyclic.
    fn soft_edges(
        &self,
        mods: &BTreeMap<&str, &ModManifest>,
        active: &BTreeSet<String>,
        graph: &DependencyGraph,
        resolution: &mut Resolution,
    ) -> Vec<(String, String)> {
        let mut accepted: Vec<(String, String)> = Vec::new();

        for id in active {
            let Some(manifest) = mods.get(id.as_str()) else {
                continue;
            };
            let hints = manifest
                .load_after
                .iter()
                .map(|after| (after.clone(), id.clone()))
                .chain(
                    manifest
                        .load_before
                        .iter()
                        .map(|before| (id.clone(), before.clone())),
                );

            for (first, second) in hints {
                if !active.contains(&first) || !active.contains(&second) {
                    continue;
                }
                if accepted.contains(&(first.clone(), second.clone())) {
                    continue;
                }
                if graph.reaches(&second, &first, &accepted) {
                    resolution.issues.push(ResolveIssue::warning(
                        id,
                        format!(
                            "ordering hint '{}' before '{}' conflicts with dependencies and was dropped",
                            first, second
                        ),
                    ));
                    continue;
                }
                accepted.push((first, second));
            }
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(id: &str, deps: &[&str]) -> ModManifest {
        let deps: Vec<String> = deps
            .iter()
            .map(|d| format!(r#"{{"modId":"{}"}}"#, d))
            .collect();
        ModManifest::from_str(&format!(
            r#"{{"id":"{id}","name":"{id}","version":"1.0.0","apiVersion":"^1.0",
                "entryPoint":"main.lua","dependencies":[{}]}}"#,
            deps.join(",")
        ))
        .unwrap()
    }

    fn with(id: &str, extra: &str) -> ModManifest {
        ModManifest::from_str(&format!(
            r#"{{"id":"{id}","name":"{id}","version":"1.0.0","apiVersion":"^1.0",
                "entryPoint":"main.lua",{extra}}}"#
        ))
        .unwrap()
    }

    fn resolver() -> DependencyResolver {
        DependencyResolver::new(Version::new(1, 0, 0))
    }

    #[test]
    fn test_chain_order() {
        let mods = vec![manifest("A", &["B"]), manifest("B", &["C"]), manifest("C", &[])];
        let resolution = resolver().resolve(&mods);
        assert_eq!(resolution.order, vec!["C", "B", "A"]);
        assert!(resolution.is_clean());
    }

    #[test]
    fn test_two_cycle_is_named() {
        let mods = vec![manifest("A", &["B"]), manifest("B", &["A"]), manifest("X", &[])];
        let resolution = resolver().resolve(&mods);

        let cycle: Vec<_> = resolution
            .errors()
            .filter(|i| i.kind == Some(ErrorKind::DependencyCyclic))
            .collect();
        assert_eq!(cycle.len(), 1);
        assert_eq!(cycle[0].related, vec!["A", "B"]);
        assert_eq!(cycle[0].message, "Dependency cycle: A -> B -> A");
        assert_eq!(resolution.order, vec!["X"]);
        assert!(resolution.failed.contains_key("A"));
        assert!(resolution.failed.contains_key("B"));
    }

    #[test]
    fn test_cycle_blocks_only_dependents() {
        let mods = vec![
            manifest("a", &["c"]),
            manifest("b", &["a"]),
            manifest("c", &["b"]),
            manifest("d", &["a"]),
            manifest("e", &[]),
        ];
        let resolution = resolver().resolve(&mods);
        let cycle = resolution
            .errors()
            .find(|i| i.kind == Some(ErrorKind::DependencyCyclic))
            .unwrap();
        assert_eq!(cycle.related, vec!["a", "c", "b"]);
        assert_eq!(
            resolution.failed["d"].kind,
            Some(ErrorKind::DependencyFailed)
        );
        assert_eq!(resolution.order, vec!["e"]);
    }

    #[test]
    fn test_lexical_tie_break() {
        let mods = vec![manifest("zeta", &[]), manifest("alpha", &[]), manifest("mid", &["zeta"])];
        let resolution = resolver().resolve(&mods);
        assert_eq!(resolution.order, vec!["alpha", "zeta", "mid"]);
    }

    #[test]
    fn test_missing_dependency_is_scoped() {
        let mods = vec![
            manifest("a", &["ghost"]),
            manifest("b", &["a"]),
            manifest("c", &[]),
        ];
        let resolution = resolver().resolve(&mods);
        assert_eq!(resolution.order, vec!["c"]);
        assert_eq!(resolution.failed["a"].kind, Some(ErrorKind::DependencyMissing));
        assert_eq!(resolution.failed["b"].kind, Some(ErrorKind::DependencyFailed));
        assert_eq!(resolution.failed["b"].related, vec!["a"]);
    }

    #[test]
    fn test_optional_missing_is_warning() {
        let mods = vec![with("a", r#""dependencies":[{"modId":"ghost","optional":true}]"#)];
        let resolution = resolver().resolve(&mods);
        assert_eq!(resolution.order, vec!["a"]);
        assert!(resolution.is_clean());
        assert_eq!(resolution.warnings().count(), 1);
    }

    #[test]
    fn test_version_mismatch() {
        let mods = vec![
            with("a", r#""dependencies":[{"modId":"b","version":">=2.0"}]"#),
            manifest("b", &[]),
        ];
        let resolution = resolver().resolve(&mods);
        assert_eq!(
            resolution.failed["a"].kind,
            Some(ErrorKind::DependencyIncompatible)
        );
        assert_eq!(resolution.order, vec!["b"]);
    }

    #[test]
    fn test_host_api_mismatch() {
        let old = ModManifest::from_str(
            r#"{"id":"old","name":"Old","version":"1.0.0","apiVersion":"^0.3","entryPoint":"main.lua"}"#,
        )
        .unwrap();
        let resolution = resolver().resolve(&[old]);
        assert!(resolution.order.is_empty());
        assert_eq!(
            resolution.failed["old"].kind,
            Some(ErrorKind::DependencyIncompatible)
        );
    }

    #[test]
    fn test_incompatible_with_present_mod() {
        let mods = vec![with("a", r#""incompatibleWith":["b"]"#), manifest("b", &[])];
        let resolution = resolver().resolve(&mods);
        assert_eq!(resolution.order, vec!["b"]);
        assert!(resolution.failed.contains_key("a"));
    }

    #[test]
    fn test_duplicate_keeps_first() {
        let first = manifest("a", &[]);
        let second = with("a", r#""description":"second copy""#);
        let resolution = resolver().resolve(&[first, second]);
        assert_eq!(resolution.order, vec!["a"]);
        assert_eq!(resolution.errors().next().unwrap().kind, Some(ErrorKind::DuplicateMod));
    }

    #[test]
    fn test_soft_hints_apply() {
        let mods = vec![with("a", r#""loadAfter":["b"]"#), manifest("b", &[])];
        let resolution = resolver().resolve(&mods);
        assert_eq!(resolution.order, vec!["b", "a"]);

        let mods = vec![manifest("a", &[]), with("z", r#""loadBefore":["a"]"#)];
        let resolution = resolver().resolve(&mods);
        assert_eq!(resolution.order, vec!["z", "a"]);
    }

    #[test]
    fn test_soft_hint_never_overrides_hard() {
        let mods = vec![
            with("a", r#""loadBefore":["b"],"dependencies":[{"modId":"b"}]"#),
            manifest("b", &[]),
            manifest("c", &[]),
        ];
        let resolution = resolver().resolve(&mods);
        assert!(resolution.position("b").unwrap() < resolution.position("a").unwrap());
        assert_eq!(resolution.warnings().count(), 1);
        assert!(resolution.is_clean());
    }

    #[test]
    fn test_transitive_dependents() {
        let mods = vec![manifest("a", &[]), manifest("b", &["a"]), manifest("c", &["b"]), manifest("d", &[])];
        let resolution = resolver().resolve(&mods);
        let dependents = resolution.graph.transitive_dependents("a");
        assert_eq!(dependents.into_iter().collect::<Vec<_>>(), vec!["b", "c"]);
    }
}
