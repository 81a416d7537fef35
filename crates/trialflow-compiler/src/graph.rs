use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use trialflow_model::{Experiment, Step};
use trialflow_types::{Result, TrialflowError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Trial,
    Loop,
}

#[derive(Debug, Clone)]
pub struct StepNode {
    pub id: String,
    pub name: String,
    pub kind: StepKind,
    pub plugin: String,
    /// Arena index of the enclosing loop; `None` on the top-level timeline.
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Declared branch targets that exist in the experiment.
    pub branches: Vec<usize>,
    /// Declared branch ids with no matching step.
    pub unresolved_branches: Vec<String>,
}

/// Arena of every step in an experiment, built once per compile.
///
/// Nodes are stored in depth-first timeline order: each loop is followed
/// directly by its children.
#[derive(Debug, Clone, Default)]
pub struct StepGraph {
    nodes: Vec<StepNode>,
    index: HashMap<String, usize>,
    top_level: Vec<usize>,
}

impl StepGraph {
    pub fn build(experiment: &Experiment) -> Result<Self> {
        let mut graph = StepGraph::default();

        for step in &experiment.timeline {
            let idx = graph.insert(step, None)?;
            graph.top_level.push(idx);
            if let Step::Loop(l) = step {
                for trial in &l.trials {
                    let child = graph.insert(&Step::Trial(trial.clone()), Some(idx))?;
                    graph.nodes[idx].children.push(child);
                }
            }
        }

        // Second pass: resolve branch ids now that every step has an index.
        let declared: Vec<(usize, Vec<String>)> = experiment
            .timeline
            .iter()
            .flat_map(|step| {
                let mut out = vec![(step.id().to_string(), step.branches().to_vec())];
                if let Step::Loop(l) = step {
                    out.extend(l.trials.iter().map(|t| (t.id.clone(), t.branches.clone())));
                }
                out
            })
            .filter_map(|(id, branches)| graph.index.get(&id).map(|&i| (i, branches)))
            .collect();

        for (idx, branch_ids) in declared {
            for target in branch_ids {
                match graph.index.get(&target) {
                    Some(&t) => graph.nodes[idx].branches.push(t),
                    None => graph.nodes[idx].unresolved_branches.push(target),
                }
            }
        }

        tracing::debug!(steps = graph.nodes.len(), "Step graph built");
        Ok(graph)
    }

    fn insert(&mut self, step: &Step, parent: Option<usize>) -> Result<usize> {
        let id = step.id().to_string();
        if self.index.contains_key(&id) {
            return Err(TrialflowError::DuplicateStep { id });
        }
        let (kind, plugin) = match step {
            Step::Trial(t) => (StepKind::Trial, t.plugin.clone()),
            Step::Loop(_) => (StepKind::Loop, String::new()),
        };
        let idx = self.nodes.len();
        self.nodes.push(StepNode {
            id: id.clone(),
            name: step.name().to_string(),
            kind,
            plugin,
            parent,
            children: Vec::new(),
            branches: Vec::new(),
            unresolved_branches: Vec::new(),
        });
        self.index.insert(id, idx);
        Ok(idx)
    }

    pub fn node(&self, id: &str) -> Option<&StepNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn node_at(&self, idx: usize) -> &StepNode {
        &self.nodes[idx]
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// The loop directly enclosing `id`, if any.
    pub fn enclosing_loop(&self, id: &str) -> Option<&StepNode> {
        self.node(id)
            .and_then(|n| n.parent)
            .map(|p| &self.nodes[p])
    }

    /// Whether two steps share an enclosing scope (same loop, or both top-level).
    pub fn same_scope(&self, a: &str, b: &str) -> bool {
        match (self.node(a), self.node(b)) {
            (Some(na), Some(nb)) => na.parent == nb.parent,
            _ => false,
        }
    }

    /// Whether `to` is one of the branches `from` declares directly.
    pub fn is_declared_branch(&self, from: &str, to: &str) -> bool {
        match (self.node(from), self.index_of(to)) {
            (Some(n), Some(t)) => n.branches.contains(&t),
            _ => false,
        }
    }

    /// Find `target` in the branch tree rooted at `from`, following branches of
    /// branches to any depth.
    pub fn resolve_branch(&self, from: &str, target: &str) -> Option<&StepNode> {
        let start = self.index_of(from)?;
        let mut visited = HashSet::new();
        let mut queue: VecDeque<usize> = self.nodes[start].branches.iter().copied().collect();

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            let node = &self.nodes[current];
            if node.id == target {
                return Some(node);
            }
            queue.extend(node.branches.iter().copied());
        }
        None
    }

    pub fn top_level(&self) -> impl Iterator<Item = &StepNode> {
        self.top_level.iter().map(|&i| &self.nodes[i])
    }

    pub fn children(&self, id: &str) -> impl Iterator<Item = &StepNode> {
        self.node(id)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(|&i| &self.nodes[i])
    }

    /// Every step, loops and nested trials alike, for jump-target listings.
    pub fn all_steps(&self) -> impl Iterator<Item = &StepNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(json: &str) -> StepGraph {
        let exp = Experiment::from_json(json).unwrap();
        StepGraph::build(&exp).unwrap()
    }

    const NESTED: &str = r#"{ "timeline": [
        { "type": "trial", "id": "intro", "branches": ["A", "B"] },
        { "type": "trial", "id": "A", "branches": ["A1"] },
        { "type": "trial", "id": "A1", "branches": ["A2"] },
        { "type": "trial", "id": "A2" },
        { "type": "trial", "id": "B" },
        { "type": "loop", "id": "block", "branches": ["B"], "trials": [
            { "id": "fix", "branches": ["stim", "ghost"] },
            { "id": "stim" }
        ]}
    ] }"#;

    #[test]
    fn arena_is_depth_first_timeline_order() {
        let g = build(NESTED);
        let ids: Vec<_> = g.all_steps().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["intro", "A", "A1", "A2", "B", "block", "fix", "stim"]);
        assert_eq!(g.len(), 8);
        assert_eq!(g.top_level().count(), 6);
        let kids: Vec<_> = g.children("block").map(|n| n.id.as_str()).collect();
        assert_eq!(kids, vec!["fix", "stim"]);
        assert_eq!(g.node("block").unwrap().kind, StepKind::Loop);
    }

    #[test]
    fn enclosing_loop_and_scope() {
        let g = build(NESTED);
        assert_eq!(g.enclosing_loop("stim").unwrap().id, "block");
        assert!(g.enclosing_loop("intro").is_none());
        assert!(g.enclosing_loop("block").is_none());
        assert!(g.same_scope("fix", "stim"));
        assert!(g.same_scope("intro", "block"));
        assert!(!g.same_scope("intro", "stim"));
        assert!(!g.same_scope("intro", "nope"));
    }

    #[test]
    fn resolve_branch_searches_nested_branch_trees() {
        let g = build(NESTED);
        assert_eq!(g.resolve_branch("intro", "A").unwrap().id, "A");
        assert_eq!(g.resolve_branch("intro", "A2").unwrap().id, "A2");
        assert!(g.resolve_branch("intro", "block").is_none());
        assert!(g.resolve_branch("B", "A").is_none());
        assert!(g.is_declared_branch("intro", "B"));
        assert!(!g.is_declared_branch("intro", "A2"));
    }

    #[test]
    fn unresolved_branches_are_recorded() {
        let g = build(NESTED);
        let fix = g.node("fix").unwrap();
        assert_eq!(fix.branches.len(), 1);
        assert_eq!(fix.unresolved_branches, vec!["ghost".to_string()]);
    }

    #[test]
    fn resolve_branch_survives_cycles() {
        let g = build(
            r#"{ "timeline": [
                { "type": "trial", "id": "x", "branches": ["y"] },
                { "type": "trial", "id": "y", "branches": ["x"] }
            ] }"#,
        );
        assert!(g.resolve_branch("x", "missing").is_none());
        assert_eq!(g.resolve_branch("x", "x").unwrap().id, "x");
    }

    #[test]
    fn duplicate_ids_rejected() {
        let exp = Experiment::from_json(
            r#"{ "timeline": [
                { "type": "trial", "id": "a" },
                { "type": "loop", "id": "L", "trials": [ { "id": "a" } ] }
            ] }"#,
        )
        .unwrap();
        match StepGraph::build(&exp) {
            Err(TrialflowError::DuplicateStep { id }) => assert_eq!(id, "a"),
            other => panic!("expected DuplicateStep, got {other:?}"),
        }
    }
}
