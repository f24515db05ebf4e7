//! DAG construction and scheduling state.
//!
//! A [`Dag`] is derived from a validated [`StackSpec`] plus the resolved
//! agent definitions. Construction detects cycles by DFS marking and
//! rejects graphs without an entry point. At run time the engine drives
//! node state transitions through this structure under the per-stack lock;
//! the Dag itself does no I/O.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use crate::error::EngineError;
use crate::types::{AgentDefinition, AgentSpec, NodeError, NodeReport, NodeState, StackSpec};

#[derive(Debug)]
pub struct Node {
    pub spec: AgentSpec,
    pub definition: Arc<AgentDefinition>,
    pub state: NodeState,
    pub error: Option<NodeError>,
}

/// Incoming edge. `data_flow` marks edges from `inputFrom`; `depends`
/// edges order execution without feeding input.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub predecessor: usize,
    pub data_flow: bool,
}

#[derive(Debug)]
pub struct Dag {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    preds: Vec<Vec<Edge>>,
    succs: Vec<Vec<usize>>,
}

impl Dag {
    /// Build and validate the graph. Nodes keep declaration order, which
    /// every tie-break below relies on.
    pub fn build(
        spec: &StackSpec,
        definitions: &HashMap<String, Arc<AgentDefinition>>,
    ) -> Result<Self, EngineError> {
        let mut nodes = Vec::with_capacity(spec.agents.len());
        let mut index = HashMap::new();
        for (i, agent) in spec.agents.iter().enumerate() {
            let definition = definitions
                .get(&agent.id)
                .cloned()
                .ok_or_else(|| EngineError::Resolution(agent.uses.clone()))?;
            index.insert(agent.id.clone(), i);
            nodes.push(Node {
                spec: agent.clone(),
                definition,
                state: NodeState::Pending,
                error: None,
            });
        }

        let mut preds: Vec<Vec<Edge>> = vec![Vec::new(); nodes.len()];
        let mut succs: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (i, agent) in spec.agents.iter().enumerate() {
            for source in &agent.input_from {
                let p = *index
                    .get(source)
                    .ok_or_else(|| EngineError::Internal(format!("unknown id {:?}", source)))?;
                preds[i].push(Edge {
                    predecessor: p,
                    data_flow: true,
                });
                succs[p].push(i);
            }
            for source in &agent.depends {
                let p = *index
                    .get(source)
                    .ok_or_else(|| EngineError::Internal(format!("unknown id {:?}", source)))?;
                // A `depends` on an id already feeding input adds nothing.
                if preds[i].iter().any(|e| e.predecessor == p) {
                    continue;
                }
                preds[i].push(Edge {
                    predecessor: p,
                    data_flow: false,
                });
                succs[p].push(i);
            }
        }

        let dag = Self {
            nodes,
            index,
            preds,
            succs,
        };

        if let Some(cycle) = dag.find_cycle() {
            let ids = cycle.iter().map(|&i| dag.nodes[i].spec.id.clone()).collect();
            return Err(EngineError::CycleDetected(ids));
        }
        if !dag.nodes.is_empty() && dag.source_set().is_empty() {
            return Err(EngineError::NoEntryPoint);
        }

        Ok(dag)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn node_index(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Nodes with no predecessors, in declaration order.
    pub fn source_set(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.preds[i].is_empty())
            .collect()
    }

    /// Data-flow predecessors of `index`, in `inputFrom` declaration order.
    pub fn data_predecessors(&self, index: usize) -> Vec<usize> {
        self.preds[index]
            .iter()
            .filter(|e| e.data_flow)
            .map(|e| e.predecessor)
            .collect()
    }

    /// White/grey/black DFS; a back-edge to a grey node is a cycle, and
    /// the grey stack suffix from that node is the cycle path.
    fn find_cycle(&self) -> Option<Vec<usize>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }

        fn visit(
            node: usize,
            succs: &[Vec<usize>],
            colors: &mut [Color],
            stack: &mut Vec<usize>,
        ) -> Option<Vec<usize>> {
            colors[node] = Color::Grey;
            stack.push(node);
            for &next in &succs[node] {
                match colors[next] {
                    Color::White => {
                        if let Some(cycle) = visit(next, succs, colors, stack) {
                            return Some(cycle);
                        }
                    }
                    Color::Grey => {
                        let start = stack
                            .iter()
                            .position(|&n| n == next)
                            .expect("grey nodes are on the stack");
                        return Some(stack[start..].to_vec());
                    }
                    Color::Black => {}
                }
            }
            stack.pop();
            colors[node] = Color::Black;
            None
        }

        let mut colors = vec![Color::White; self.nodes.len()];
        let mut stack = Vec::new();
        for node in 0..self.nodes.len() {
            if colors[node] == Color::White {
                if let Some(cycle) = visit(node, &self.succs, &mut colors, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Stable topological order: repeated removal of in-degree-0 nodes,
    /// ties broken by declaration order.
    pub fn topological_order(&self) -> Vec<usize> {
        let mut in_degree: Vec<usize> = self.preds.iter().map(|p| p.len()).collect();
        let mut available: BTreeSet<usize> = (0..self.nodes.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(&node) = available.iter().next() {
            available.remove(&node);
            order.push(node);
            for &next in &self.succs[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    available.insert(next);
                }
            }
        }
        order
    }

    /// Transition every Pending node whose predecessors are all satisfied
    /// to Ready; returns the newly ready nodes in declaration order.
    pub fn promote_ready(&mut self) -> Vec<usize> {
        let mut ready = Vec::new();
        for i in 0..self.nodes.len() {
            if self.nodes[i].state != NodeState::Pending {
                continue;
            }
            let satisfied = self.preds[i]
                .iter()
                .all(|e| self.nodes[e.predecessor].state.satisfies_dependency());
            if satisfied {
                self.nodes[i].state = NodeState::Ready;
                ready.push(i);
            }
        }
        ready
    }

    pub fn mark(&mut self, index: usize, state: NodeState) {
        tracing::debug!(node = %self.nodes[index].spec.id, %state, "node transition");
        self.nodes[index].state = state;
    }

    pub fn mark_error(&mut self, index: usize, state: NodeState, error: NodeError) {
        self.nodes[index].error = Some(error);
        self.mark(index, state);
    }

    /// All transitive successors of `index`, BFS order.
    pub fn descendants(&self, index: usize) -> Vec<usize> {
        let mut seen = vec![false; self.nodes.len()];
        let mut queue: VecDeque<usize> = self.succs[index].iter().copied().collect();
        let mut result = Vec::new();
        while let Some(node) = queue.pop_front() {
            if seen[node] {
                continue;
            }
            seen[node] = true;
            result.push(node);
            queue.extend(self.succs[node].iter().copied());
        }
        result
    }

    pub fn all_terminal(&self) -> bool {
        self.nodes.iter().all(|n| n.state.is_terminal())
    }

    pub fn states(&self) -> Vec<(String, NodeState)> {
        self.nodes
            .iter()
            .map(|n| (n.spec.id.clone(), n.state))
            .collect()
    }

    /// Edges as (predecessor id, successor id, data_flow).
    pub fn edges(&self) -> Vec<(String, String, bool)> {
        let mut edges = Vec::new();
        for (i, incoming) in self.preds.iter().enumerate() {
            for edge in incoming {
                edges.push((
                    self.nodes[edge.predecessor].spec.id.clone(),
                    self.nodes[i].spec.id.clone(),
                    edge.data_flow,
                ));
            }
        }
        edges
    }

    pub fn reports(&self) -> Vec<NodeReport> {
        self.nodes
            .iter()
            .map(|n| NodeReport {
                id: n.spec.id.clone(),
                state: n.state,
                error: n.error.clone(),
            })
            .collect()
    }
}
