use std::sync::Arc;

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::instrument;

use crate::callback::CallbackHandler;
use crate::schema::{registry, SchemaId};

use super::branch::BranchPredicate;
use super::builder::{Graph, GraphError};
use super::node::NodeKey;
use super::plan::{Carrier, GraphInfo, MergePlan, Plan, PlanInner, PlanMode, PlanNode};

/// Options fixed at compile time.
#[derive(Default)]
pub struct CompileOptions {
    pub(crate) max_steps: Option<usize>,
    pub(crate) callbacks: Vec<Arc<dyn CallbackHandler>>,
}

impl CompileOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Superstep bound for cyclic graphs. Mandatory when the graph has a
    /// cycle; ignored for DAGs.
    #[must_use]
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    /// Register a global callback handler, invoked around every node of
    /// every execution of the plan.
    #[must_use]
    pub fn with_callback(mut self, handler: Arc<dyn CallbackHandler>) -> Self {
        self.callbacks.push(handler);
        self
    }
}

impl Graph {
    /// Validate the IR and lower it into an immutable [`Plan`].
    ///
    /// Passes, in order: topology assembly, reachability, per-edge type
    /// compatibility with fan-in resolution, cycle detection (cycle ⇒
    /// stepwise schedule, DAG ⇒ wave layout), carrier selection with
    /// concatenator checks, and plan emission.
    #[instrument(skip(self, options), err)]
    pub fn compile(self, options: CompileOptions) -> Result<Plan, GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::EmptyGraph);
        }

        let topology = self.assemble_topology();
        self.check_reachability(&topology)?;
        let merges = self.resolve_merges(&topology)?;
        self.check_edge_types(&topology, &merges)?;
        let carriers = self.select_carriers(&topology)?;
        let mode = self.decide_mode(&topology, &options)?;
        let info = self.build_info();

        let input_schema = topology
            .succs
            .get(&NodeKey::Start)
            .and_then(|succs| succs.first())
            .and_then(|key| self.nodes.get(key))
            .map(|entry| entry.spec.input_schema.clone())
            .unwrap_or_else(SchemaId::json);
        let output_schema = topology
            .preds
            .get(&NodeKey::End)
            .and_then(|preds| preds.first())
            .and_then(|key| self.nodes.get(key))
            .map(|entry| entry.spec.output_schema.clone())
            .unwrap_or_else(SchemaId::json);

        let mut plan_nodes = FxHashMap::default();
        for key in &self.order {
            let entry = &self.nodes[key];
            plan_nodes.insert(key.clone(), PlanNode::from_spec(&entry.spec, &entry.options));
        }

        Ok(Plan {
            inner: Arc::new(PlanInner {
                nodes: plan_nodes,
                preds: topology.preds,
                succs: topology.succs,
                branch_only_succs: topology.branch_only,
                branches: self.branches,
                merges,
                carriers,
                coercions: self.coercions,
                mode,
                callbacks: options.callbacks,
                info,
                input_schema,
                output_schema,
            }),
        })
    }

    /// Combined successor/predecessor sets over control edges, data edges,
    /// and branch candidates, in deterministic wiring order.
    fn assemble_topology(&self) -> Topology {
        let mut succs: FxHashMap<NodeKey, Vec<NodeKey>> = FxHashMap::default();
        let mut preds: FxHashMap<NodeKey, Vec<NodeKey>> = FxHashMap::default();
        let mut branch_only: FxHashMap<NodeKey, Vec<NodeKey>> = FxHashMap::default();

        let mut push_unique = |table: &mut FxHashMap<NodeKey, Vec<NodeKey>>,
                               key: &NodeKey,
                               value: &NodeKey| {
            let list = table.entry(key.clone()).or_default();
            if !list.contains(value) {
                list.push(value.clone());
            }
        };

        for from in self.source_order() {
            for table in [&self.edges, &self.data_edges] {
                if let Some(tos) = table.get(&from) {
                    for to in tos {
                        push_unique(&mut succs, &from, to);
                        push_unique(&mut preds, to, &from);
                    }
                }
            }
            if let Some(branches) = self.branches.get(&from) {
                for branch in branches {
                    for candidate in branch.candidates() {
                        let already_edged = succs
                            .get(&from)
                            .is_some_and(|list| list.contains(candidate));
                        if !already_edged {
                            push_unique(&mut branch_only, &from, candidate);
                        }
                        push_unique(&mut succs, &from, candidate);
                        push_unique(&mut preds, candidate, &from);
                    }
                }
            }
        }

        Topology {
            succs,
            preds,
            branch_only,
        }
    }

    /// Deterministic iteration order over potential edge sources.
    fn source_order(&self) -> Vec<NodeKey> {
        let mut order = Vec::with_capacity(self.order.len() + 1);
        order.push(NodeKey::Start);
        order.extend(self.order.iter().cloned());
        order
    }

    /// Every node must be reachable from `start` and must reach `end`.
    fn check_reachability(&self, topology: &Topology) -> Result<(), GraphError> {
        let forward = bfs(&topology.succs, NodeKey::Start);
        for key in &self.order {
            if !forward.contains(key) {
                return Err(GraphError::Unreachable { key: key.clone() });
            }
        }
        let backward = bfs(&topology.preds, NodeKey::End);
        for key in &self.order {
            if !backward.contains(key) {
                return Err(GraphError::Unreachable { key: key.clone() });
            }
        }
        if !backward.contains(&NodeKey::Start) {
            // Nothing flows into `end` at all.
            return Err(GraphError::Unreachable { key: NodeKey::End });
        }
        Ok(())
    }

    /// Fix each node's fan-in merge strategy.
    fn resolve_merges(
        &self,
        topology: &Topology,
    ) -> Result<FxHashMap<NodeKey, MergePlan>, GraphError> {
        let mut merges = FxHashMap::default();
        let mut targets: Vec<NodeKey> = self.order.clone();
        targets.push(NodeKey::End);

        for key in targets {
            let preds = topology.preds.get(&key).map(Vec::as_slice).unwrap_or(&[]);
            let merger = self
                .nodes
                .get(&key)
                .and_then(|entry| entry.options.merger.clone());
            let plan = if let Some(merger) = merger {
                MergePlan::User(merger)
            } else if preds.len() <= 1 {
                MergePlan::Single
            } else {
                let any_slotted = preds.iter().any(|pred| {
                    self.nodes
                        .get(pred)
                        .is_some_and(|entry| entry.options.output_key.is_some())
                });
                if any_slotted {
                    MergePlan::MapBySlot
                } else {
                    MergePlan::ListAppend
                }
            };
            merges.insert(key, plan);
        }
        Ok(merges)
    }

    /// Structural compatibility per edge, under the fan-in strategy of the
    /// consuming node.
    fn check_edge_types(
        &self,
        topology: &Topology,
        merges: &FxHashMap<NodeKey, MergePlan>,
    ) -> Result<(), GraphError> {
        for (to, preds) in &topology.preds {
            if *to == NodeKey::End {
                // `end` adopts its producer's schema.
                continue;
            }
            let Some(entry) = self.nodes.get(to) else {
                continue;
            };
            let in_schema = &entry.spec.input_schema;
            match merges.get(to) {
                Some(MergePlan::User(_)) => {
                    // The merger owns the assembled shape.
                }
                Some(MergePlan::MapBySlot) => {
                    if let Some(input_key) = &entry.options.input_key {
                        // Consumer reads one slot: check that slot's producer.
                        for pred in preds {
                            let slot = self.slot_name(pred);
                            if slot.as_deref() == Some(input_key.as_str()) {
                                self.check_pair(pred, to, in_schema)?;
                            }
                        }
                    } else if *in_schema != SchemaId::json() {
                        // The merged map is a JSON object; a consumer that
                        // declares something else cannot take it whole.
                        return Err(GraphError::TypeMismatch {
                            from: preds[0].clone(),
                            to: to.clone(),
                            from_schema: SchemaId::json(),
                            to_schema: in_schema.clone(),
                        });
                    }
                }
                Some(MergePlan::ListAppend) => {
                    // Outputs are reduced with the consumer schema's
                    // concatenator, or delivered as a JSON array.
                    if *in_schema != SchemaId::json() && !registry().has_concat(in_schema) {
                        return Err(GraphError::MissingConcatenator {
                            key: to.clone(),
                            schema: in_schema.clone(),
                        });
                    }
                }
                Some(MergePlan::Single) | None => {
                    for pred in preds {
                        if *pred == NodeKey::Start {
                            continue;
                        }
                        self.check_pair(pred, to, in_schema)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Check one `(from, to)` pair under the consumer's declared schema.
    fn check_pair(
        &self,
        from: &NodeKey,
        to: &NodeKey,
        to_schema: &SchemaId,
    ) -> Result<(), GraphError> {
        let Some(from_entry) = self.nodes.get(from) else {
            return Ok(());
        };
        let from_schema = &from_entry.spec.output_schema;
        if from_schema == to_schema {
            return Ok(());
        }
        if self.coercions.contains_key(&(from.clone(), to.clone())) {
            return Ok(());
        }
        Err(GraphError::TypeMismatch {
            from: from.clone(),
            to: to.clone(),
            from_schema: from_schema.clone(),
            to_schema: to_schema.clone(),
        })
    }

    /// Decide each edge's carrier and verify that every stream the engine
    /// must collapse has a concatenator.
    fn select_carriers(
        &self,
        topology: &Topology,
    ) -> Result<FxHashMap<(NodeKey, NodeKey), Carrier>, GraphError> {
        let mut carriers = FxHashMap::default();
        for (from, tos) in &topology.succs {
            let from_streams = self
                .nodes
                .get(from)
                .is_some_and(|entry| entry.spec.computation.streams_out());
            let from_schema = self
                .nodes
                .get(from)
                .map(|entry| entry.spec.output_schema.clone());

            for to in tos {
                let to_streams = self
                    .nodes
                    .get(to)
                    .is_some_and(|entry| entry.spec.computation.streams_in());
                let carrier = if from_streams || to_streams {
                    Carrier::Stream
                } else {
                    Carrier::Eager
                };
                carriers.insert((from.clone(), to.clone()), carrier);

                // A streaming producer feeding an eager consumer (or any
                // fan-in, which buffers eagerly) is collapsed by concat:
                // that requires a registered concatenator.
                if from_streams {
                    let fan_in = topology
                        .preds
                        .get(to)
                        .is_some_and(|preds| preds.len() > 1);
                    let needs_concat = (!to_streams && *to != NodeKey::End) || fan_in;
                    if needs_concat {
                        if let Some(schema) = &from_schema {
                            if !registry().has_concat(schema) {
                                return Err(GraphError::MissingConcatenator {
                                    key: from.clone(),
                                    schema: schema.clone(),
                                });
                            }
                        }
                    }
                }
            }

            // An eager branch predicate on a streaming producer also
            // concatenates the output before evaluation.
            if from_streams {
                if let Some(branches) = self.branches.get(from) {
                    let needs_concat = branches
                        .iter()
                        .any(|b| matches!(b.predicate, BranchPredicate::Value(_)));
                    if needs_concat {
                        if let Some(schema) = &from_schema {
                            if !registry().has_concat(schema) {
                                return Err(GraphError::MissingConcatenator {
                                    key: from.clone(),
                                    schema: schema.clone(),
                                });
                            }
                        }
                    }
                }
            }
        }
        Ok(carriers)
    }

    /// Cycle ⇒ stepwise (requires a step bound); DAG ⇒ wave layout.
    fn decide_mode(
        &self,
        topology: &Topology,
        options: &CompileOptions,
    ) -> Result<PlanMode, GraphError> {
        let graph = to_petgraph(topology);
        if is_cyclic_directed(&graph) {
            let max_steps = options.max_steps.ok_or(GraphError::CycleWithoutStepLimit)?;
            return Ok(PlanMode::Stepwise { max_steps });
        }

        // Longest-path depth from `start` groups nodes into waves: all
        // predecessors of a wave-k node sit in earlier waves.
        let mut depth: FxHashMap<NodeKey, usize> = FxHashMap::default();
        depth.insert(NodeKey::Start, 0);
        let sorted = petgraph::algo::toposort(&graph, None)
            .map_err(|_| GraphError::CycleWithoutStepLimit)?;
        for idx in sorted {
            let key = graph[idx].clone();
            let level = depth.get(&key).copied().unwrap_or(0);
            for succ in graph.neighbors(idx) {
                let succ_key = graph[succ].clone();
                let entry = depth.entry(succ_key).or_insert(0);
                *entry = (*entry).max(level + 1);
            }
        }

        let mut waves: Vec<Vec<NodeKey>> = Vec::new();
        for key in &self.order {
            let level = depth.get(key).copied().unwrap_or(1);
            while waves.len() < level {
                waves.push(Vec::new());
            }
            waves[level - 1].push(key.clone());
        }
        waves.retain(|wave| !wave.is_empty());
        Ok(PlanMode::Dag { waves })
    }

    fn build_info(&self) -> GraphInfo {
        let mut info = GraphInfo::default();
        for key in &self.order {
            let entry = &self.nodes[key];
            info.nodes
                .push((key.as_str().to_string(), entry.spec.component.to_string()));
        }
        for from in self.source_order() {
            if let Some(tos) = self.edges.get(&from) {
                for to in tos {
                    info.edges
                        .push((from.as_str().to_string(), to.as_str().to_string()));
                }
            }
            if let Some(tos) = self.data_edges.get(&from) {
                for to in tos {
                    info.data_edges
                        .push((from.as_str().to_string(), to.as_str().to_string()));
                }
            }
            if let Some(branches) = self.branches.get(&from) {
                for branch in branches {
                    info.branches.push((
                        from.as_str().to_string(),
                        branch
                            .candidates()
                            .iter()
                            .map(|c| c.as_str().to_string())
                            .collect(),
                    ));
                }
            }
        }
        info
    }

    fn slot_name(&self, pred: &NodeKey) -> Option<String> {
        self.nodes.get(pred).map(|entry| {
            entry
                .options
                .output_key
                .clone()
                .unwrap_or_else(|| pred.as_str().to_string())
        })
    }
}

struct Topology {
    succs: FxHashMap<NodeKey, Vec<NodeKey>>,
    preds: FxHashMap<NodeKey, Vec<NodeKey>>,
    branch_only: FxHashMap<NodeKey, Vec<NodeKey>>,
}

fn bfs(adjacency: &FxHashMap<NodeKey, Vec<NodeKey>>, from: NodeKey) -> FxHashSet<NodeKey> {
    let mut seen = FxHashSet::default();
    let mut queue = std::collections::VecDeque::new();
    seen.insert(from.clone());
    queue.push_back(from);
    while let Some(key) = queue.pop_front() {
        if let Some(nexts) = adjacency.get(&key) {
            for next in nexts {
                if seen.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }
    }
    seen
}

fn to_petgraph(topology: &Topology) -> DiGraph<NodeKey, ()> {
    let mut graph = DiGraph::new();
    let mut index_map: FxHashMap<NodeKey, NodeIndex> = FxHashMap::default();

    fn index_of(
        graph: &mut DiGraph<NodeKey, ()>,
        index_map: &mut FxHashMap<NodeKey, NodeIndex>,
        key: &NodeKey,
    ) -> NodeIndex {
        if let Some(idx) = index_map.get(key) {
            return *idx;
        }
        let idx = graph.add_node(key.clone());
        index_map.insert(key.clone(), idx);
        idx
    }

    for (from, tos) in &topology.succs {
        for to in tos {
            let from_idx = index_of(&mut graph, &mut index_map, from);
            let to_idx = index_of(&mut graph, &mut index_map, to);
            graph.add_edge(from_idx, to_idx, ());
        }
    }
    graph
}
