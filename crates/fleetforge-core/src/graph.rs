//! Component dependency graph and build ordering.
//!
//! An edge `A -> B` means "B depends on A": A's artifact must exist before B
//! is built. The graph is validated once, at construction: unknown
//! dependencies and cycles are rejected before any job exists. Ordering uses
//! Kahn's algorithm with catalog declaration order as the tie-break, so logs
//! and artifact ordering are deterministic.

use crate::job::{BuildJob, JobStatus};
use fleetforge_schema::{ComponentName, ComponentTable, ResolvedComponent, ResolvedPlan};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use thiserror::Error;

/// A dependency cycle, as the path of components that closes it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct CycleError {
    pub path: Vec<ComponentName>,
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path: Vec<&str> = self.path.iter().map(ComponentName::as_str).collect();
        write!(f, "dependency cycle: {}", path.join(" -> "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error(transparent)]
    Cycle(#[from] CycleError),
    #[error("component '{component}' depends on unknown component '{dependency}'")]
    UnknownDependency {
        component: String,
        dependency: String,
    },
    #[error("unknown component '{0}'")]
    UnknownComponent(String),
    #[error("component '{0}' is missing from the plan")]
    NotInPlan(String),
}

/// Which components a build run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every component in the plan.
    All,
    /// The named targets plus those of their transitive dependencies that are not built yet.
    Only(Vec<ComponentName>),
}

#[derive(Debug, Clone)]
pub struct BuildGraph {
    table: ComponentTable,
    /// `dependent -> {dependency, ...}`
    upstream: BTreeMap<ComponentName, BTreeSet<ComponentName>>,
    /// `dependency -> {dependent, ...}`
    downstream: BTreeMap<ComponentName, BTreeSet<ComponentName>>,
}

impl BuildGraph {
    pub fn from_table(table: &ComponentTable) -> Result<Self, GraphError> {
        let mut upstream: BTreeMap<ComponentName, BTreeSet<ComponentName>> = BTreeMap::new();
        let mut downstream: BTreeMap<ComponentName, BTreeSet<ComponentName>> = BTreeMap::new();
        for def in &table.components {
            upstream.entry(def.name.clone()).or_default();
            downstream.entry(def.name.clone()).or_default();
        }
        for def in &table.components {
            for dep in &def.depends_on {
                if !table.contains(dep) {
                    return Err(GraphError::UnknownDependency {
                        component: def.name.to_string(),
                        dependency: dep.to_string(),
                    });
                }
                upstream
                    .entry(def.name.clone())
                    .or_default()
                    .insert(dep.clone());
                downstream
                    .entry(dep.clone())
                    .or_default()
                    .insert(def.name.clone());
            }
        }

        let graph = Self {
            table: table.clone(),
            upstream,
            downstream,
        };
        if let Some(path) = graph.find_cycle() {
            return Err(CycleError { path }.into());
        }
        Ok(graph)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains(name)
    }

    pub fn dependencies_of(&self, name: &ComponentName) -> impl Iterator<Item = &ComponentName> {
        self.upstream.get(name).into_iter().flatten()
    }

    /// All components that transitively depend on `name` (BFS over downstream edges).
    pub fn transitive_dependents(&self, name: &ComponentName) -> BTreeSet<ComponentName> {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([name.clone()]);
        while let Some(current) = queue.pop_front() {
            for dep in self.downstream.get(&current).into_iter().flatten() {
                if visited.insert(dep.clone()) {
                    queue.push_back(dep.clone());
                }
            }
        }
        visited
    }

    /// DFS over the table in declaration order; returns the first cycle found.
    fn find_cycle(&self) -> Option<Vec<ComponentName>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        fn visit(
            graph: &BuildGraph,
            node: &ComponentName,
            marks: &mut BTreeMap<ComponentName, Mark>,
            stack: &mut Vec<ComponentName>,
        ) -> Option<Vec<ComponentName>> {
            marks.insert(node.clone(), Mark::InProgress);
            stack.push(node.clone());
            for dep in graph.dependencies_of(node) {
                match marks.get(dep).copied().unwrap_or(Mark::Unvisited) {
                    Mark::InProgress => {
                        let start = stack.iter().position(|n| n == dep).unwrap_or(0);
                        let mut cycle = stack[start..].to_vec();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        if let Some(cycle) = visit(graph, dep, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            stack.pop();
            marks.insert(node.clone(), Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        for def in &self.table.components {
            if marks.get(&def.name).copied().unwrap_or(Mark::Unvisited) == Mark::Unvisited {
                let mut stack = Vec::new();
                if let Some(cycle) = visit(self, &def.name, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Produce the ordered jobs for one build run.
    ///
    /// `is_built` reports whether a component's artifact at its planned
    /// revision already exists; it only matters for [`Selection::Only`], where
    /// built dependencies are not rebuilt and not traversed further.
    pub fn order(
        &self,
        plan: &ResolvedPlan,
        selection: &Selection,
        is_built: &dyn Fn(&ResolvedComponent) -> bool,
    ) -> Result<Vec<BuildJob>, GraphError> {
        for def in &self.table.components {
            if plan.get(&def.name).is_none() {
                return Err(GraphError::NotInPlan(def.name.to_string()));
            }
        }

        let included: BTreeSet<ComponentName> = match selection {
            Selection::All => self.table.names().cloned().collect(),
            Selection::Only(targets) => {
                let mut included = BTreeSet::new();
                let mut queue = VecDeque::new();
                for target in targets {
                    if !self.contains(target) {
                        return Err(GraphError::UnknownComponent(target.to_string()));
                    }
                    if included.insert(target.clone()) {
                        queue.push_back(target.clone());
                    }
                }
                while let Some(current) = queue.pop_front() {
                    for dep in self.dependencies_of(&current) {
                        if included.contains(dep) {
                            continue;
                        }
                        let entry = plan
                            .get(dep)
                            .ok_or_else(|| GraphError::NotInPlan(dep.to_string()))?;
                        if !is_built(entry) {
                            included.insert(dep.clone());
                            queue.push_back(dep.clone());
                        }
                    }
                }
                included
            }
        };

        // Kahn's algorithm over the included subgraph. The ready set is keyed
        // by declaration position, which makes the tie-break deterministic.
        let position = |name: &ComponentName| plan.position(name).unwrap_or(usize::MAX);
        let mut in_degree: BTreeMap<&ComponentName, usize> = included
            .iter()
            .map(|name| {
                let deg = self
                    .dependencies_of(name)
                    .filter(|d| included.contains(*d))
                    .count();
                (name, deg)
            })
            .collect();
        let mut ready: BTreeSet<(usize, &ComponentName)> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(&name, _)| (position(name), name))
            .collect();

        let mut jobs = Vec::with_capacity(included.len());
        while let Some(next) = ready.pop_first() {
            let name = next.1;
            let entry = plan
                .get(name)
                .ok_or_else(|| GraphError::NotInPlan(name.to_string()))?;
            let def = self
                .table
                .get(name)
                .ok_or_else(|| GraphError::UnknownComponent(name.to_string()))?;
            jobs.push(BuildJob {
                component: name.clone(),
                revision: entry.commit.clone(),
                branch: entry.branch.clone(),
                symbolic: entry.symbolic,
                depends_on: def.depends_on.clone(),
                output: def.artifact_path(&entry.commit),
                status: JobStatus::Pending,
            });

            for dependent in self.downstream.get(name).into_iter().flatten() {
                if let Some(deg) = in_degree.get_mut(dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert((position(dependent), dependent));
                    }
                }
            }
        }

        if jobs.len() != included.len() {
            // Unreachable for graphs built by from_table; kept as a hard stop.
            let path = included
                .iter()
                .filter(|n| !jobs.iter().any(|j| j.component == **n))
                .cloned()
                .collect();
            return Err(CycleError { path }.into());
        }
        Ok(jobs)
    }
}
