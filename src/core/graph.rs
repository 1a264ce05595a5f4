//! Pipeline graph - job instances plus dependency edges, validated once

use crate::core::{
    error::LoadError,
    job::{InstanceId, JobInstance, JobSpec},
    matrix::MatrixExpander,
};
use std::collections::{HashMap, HashSet, VecDeque};

/// Index of a job instance in the graph arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(pub usize);

/// Directed acyclic graph of job instances.
///
/// Instances live in an arena and edges are adjacency lists of arena
/// indices. Construction validates the whole definition, so a built graph
/// is always acyclic and every edge points at a real instance.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    specs: Vec<JobSpec>,
    nodes: Vec<JobInstance>,
    /// node -> index into `specs`
    spec_of: Vec<usize>,
    deps: Vec<Vec<NodeIndex>>,
    dependents: Vec<Vec<NodeIndex>>,
    by_job: HashMap<String, Vec<NodeIndex>>,
    by_id: HashMap<InstanceId, NodeIndex>,
}

impl PipelineGraph {
    /// Validate job specs, expand matrices and wire dependency edges.
    ///
    /// A `needs` entry naming a matrixed job depends on every instance of it.
    pub fn build(specs: Vec<JobSpec>) -> Result<Self, LoadError> {
        let mut spec_index: HashMap<&str, usize> = HashMap::new();
        for (i, spec) in specs.iter().enumerate() {
            if spec_index.insert(spec.name.as_str(), i).is_some() {
                return Err(LoadError::DuplicateJob(spec.name.clone()));
            }
        }

        for spec in &specs {
            if spec.strategy.as_ref().and_then(|s| s.max_parallel) == Some(0) {
                return Err(LoadError::InvalidDefinition(format!(
                    "job '{}': strategy.max_parallel must be at least 1",
                    spec.name
                )));
            }
            for dep in &spec.needs {
                if !spec_index.contains_key(dep.as_str()) {
                    return Err(LoadError::UnknownDependency {
                        job: spec.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        if let Some(cycle) = find_cycle(&specs, &spec_index) {
            return Err(LoadError::CyclicDependency { cycle });
        }

        let mut nodes = Vec::new();
        let mut spec_of = Vec::new();
        let mut by_job: HashMap<String, Vec<NodeIndex>> = HashMap::new();
        for (i, spec) in specs.iter().enumerate() {
            for instance in MatrixExpander::expand(spec)? {
                let idx = NodeIndex(nodes.len());
                by_job.entry(spec.name.clone()).or_default().push(idx);
                nodes.push(instance);
                spec_of.push(i);
            }
        }

        let mut by_id = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            if by_id.insert(node.id.clone(), NodeIndex(i)).is_some() {
                return Err(LoadError::InvalidDefinition(format!(
                    "job instance '{}' is produced twice",
                    node.id
                )));
            }
        }

        let mut deps = vec![Vec::new(); nodes.len()];
        let mut dependents = vec![Vec::new(); nodes.len()];
        for (i, &s) in spec_of.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &specs[s].needs {
                if !seen.insert(dep.as_str()) {
                    continue;
                }
                for &target in &by_job[dep] {
                    deps[i].push(target);
                    dependents[target.0].push(NodeIndex(i));
                }
            }
        }

        Ok(Self {
            specs,
            nodes,
            spec_of,
            deps,
            dependents,
            by_job,
            by_id,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn indices(&self) -> impl Iterator<Item = NodeIndex> {
        (0..self.nodes.len()).map(NodeIndex)
    }

    pub fn instance(&self, idx: NodeIndex) -> &JobInstance {
        &self.nodes[idx.0]
    }

    pub fn instance_mut(&mut self, idx: NodeIndex) -> &mut JobInstance {
        &mut self.nodes[idx.0]
    }

    pub fn instances(&self) -> impl Iterator<Item = &JobInstance> {
        self.nodes.iter()
    }

    /// The job spec an instance was expanded from
    pub fn spec(&self, idx: NodeIndex) -> &JobSpec {
        &self.specs[self.spec_of[idx.0]]
    }

    pub fn specs(&self) -> &[JobSpec] {
        &self.specs
    }

    pub fn index_of(&self, id: &InstanceId) -> Option<NodeIndex> {
        self.by_id.get(id).copied()
    }

    pub fn get(&self, id: &str) -> Option<&JobInstance> {
        self.index_of(&InstanceId::from(id)).map(|idx| self.instance(idx))
    }

    /// All instances of a job, in matrix order
    pub fn instances_of(&self, job: &str) -> &[NodeIndex] {
        self.by_job.get(job).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependencies(&self, idx: NodeIndex) -> &[NodeIndex] {
        &self.deps[idx.0]
    }

    pub fn dependents(&self, idx: NodeIndex) -> &[NodeIndex] {
        &self.dependents[idx.0]
    }

    /// Instances with no dependencies
    pub fn roots(&self) -> Vec<NodeIndex> {
        self.indices().filter(|i| self.deps[i.0].is_empty()).collect()
    }

    /// Every instance reachable forward along dependency edges
    pub fn descendants(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = self.dependents[idx.0].iter().copied().collect();
        let mut result = Vec::new();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                result.push(next);
                queue.extend(self.dependents[next.0].iter().copied());
            }
        }
        result.sort();
        result
    }

    /// Kahn's algorithm; ties broken by arena order so the result is deterministic
    pub fn topological_order(&self) -> Vec<NodeIndex> {
        let mut in_degree: Vec<usize> = self.deps.iter().map(Vec::len).collect();
        let mut ready: VecDeque<NodeIndex> = self
            .indices()
            .filter(|i| in_degree[i.0] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(idx) = ready.pop_front() {
            order.push(idx);
            for &dependent in &self.dependents[idx.0] {
                in_degree[dependent.0] -= 1;
                if in_degree[dependent.0] == 0 {
                    ready.push_back(dependent);
                }
            }
        }

        order
    }
}

/// Depth-first search over job-level edges, returning the first cycle found
/// as a path that starts and ends on the same job.
fn find_cycle(specs: &[JobSpec], spec_index: &HashMap<&str, usize>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    fn visit(
        node: usize,
        specs: &[JobSpec],
        spec_index: &HashMap<&str, usize>,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        marks[node] = Mark::OnStack;
        stack.push(node);

        for dep in &specs[node].needs {
            let next = spec_index[dep.as_str()];
            match marks[next] {
                Mark::OnStack => {
                    let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|&n| specs[n].name.clone()).collect();
                    cycle.push(specs[next].name.clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(next, specs, spec_index, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        stack.pop();
        marks[node] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::Unvisited; specs.len()];
    let mut stack = Vec::new();
    for i in 0..specs.len() {
        if marks[i] == Mark::Unvisited {
            if let Some(cycle) = visit(i, specs, spec_index, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}
