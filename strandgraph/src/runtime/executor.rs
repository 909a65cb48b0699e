use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::callback::{CallbackSet, NodeMeta};
use crate::graph::{
    Branch, BranchPredicate, Computation, MergePlan, NodeKey, Plan, PlanInput, PlanMode,
};
use crate::schema::SchemaId;
use crate::stream::{concat_values, StreamError, StreamReader};

use super::context::{ExecContext, ExecOptions};
use super::merge::{assemble_input, Delivery};
use super::session::Session;
use super::ExecError;

/// A value in flight on an edge, in whichever carrier the compiler chose.
pub(crate) enum Flow {
    Eager(Value),
    Stream(StreamReader<Value>),
}

impl Flow {
    /// Duplicate this flow for `n` recipients. Eager values clone;
    /// streams fan out through the copy operator.
    fn fan_out(self, n: usize) -> Vec<Flow> {
        match (self, n) {
            (_, 0) => Vec::new(),
            (flow, 1) => vec![flow],
            (Flow::Eager(value), n) => (0..n).map(|_| Flow::Eager(value.clone())).collect(),
            (Flow::Stream(reader), n) => {
                reader.copy(n).into_iter().map(Flow::Stream).collect()
            }
        }
    }
}

/// One engine drives all four entry points of a compiled plan.
pub(crate) struct Engine {
    plan: Plan,
    session: Arc<Session>,
    cancel: CancellationToken,
    callbacks: CallbackSet,
}

/// Outputs routed along a node's outgoing edges, plus the branch
/// candidates the predicates did not select.
struct Routed {
    deliveries: Vec<(NodeKey, Flow)>,
    deselected: Vec<NodeKey>,
}

impl Engine {
    pub(crate) fn new(plan: Plan, opts: ExecOptions) -> Self {
        let callbacks = CallbackSet::chained(&plan.inner.callbacks, &opts.callbacks);
        Self {
            plan,
            session: opts.session.unwrap_or_else(Session::new),
            cancel: opts.cancel.unwrap_or_default(),
            callbacks,
        }
    }

    /// Run to an eager result, concatenating a streaming terminal output.
    pub(crate) async fn run_to_value(self, input: PlanInput) -> Result<Value, ExecError> {
        let output_schema = self.plan.inner.output_schema.clone();
        match self.run(input).await? {
            Flow::Eager(value) => Ok(value),
            Flow::Stream(reader) => concat_values(reader, &output_schema)
                .await
                .map_err(|err| ExecError::from_stream(&NodeKey::End, err)),
        }
    }

    /// Run to a streaming result, wrapping an eager terminal output.
    pub(crate) async fn run_to_stream(
        self,
        input: PlanInput,
    ) -> Result<StreamReader<Value>, ExecError> {
        match self.run(input).await? {
            Flow::Eager(value) => Ok(StreamReader::of(value)),
            Flow::Stream(reader) => Ok(reader),
        }
    }

    #[instrument(skip(self, input), err)]
    async fn run(self, input: PlanInput) -> Result<Flow, ExecError> {
        let input = match input {
            PlanInput::Eager(value) => Flow::Eager(value),
            PlanInput::Stream(reader) => Flow::Stream(reader),
        };
        match self.plan.inner.mode.clone() {
            PlanMode::Dag { .. } => self.run_dag(input).await,
            PlanMode::Stepwise { max_steps } => self.run_stepwise(input, max_steps).await,
        }
    }

    // ----- DAG scheduling -------------------------------------------------

    /// Readiness-driven execution: a node runs as soon as every
    /// predecessor that can still deliver has delivered. There is no
    /// global step boundary; independent nodes overlap freely.
    async fn run_dag(&self, input: Flow) -> Result<Flow, ExecError> {
        let inner = self.plan.inner.clone();
        let mut expected: FxHashMap<NodeKey, FxHashSet<NodeKey>> = inner
            .preds
            .iter()
            .map(|(key, preds)| (key.clone(), preds.iter().cloned().collect()))
            .collect();
        let mut inbox: FxHashMap<NodeKey, Vec<(NodeKey, Flow)>> = FxHashMap::default();
        let mut started: FxHashSet<NodeKey> = FxHashSet::default();
        let mut skipped: FxHashSet<NodeKey> = FxHashSet::default();
        let mut join: JoinSet<(NodeKey, Result<Flow, ExecError>)> = JoinSet::new();
        let mut finished: Option<Flow> = None;

        let routed = self.route_outputs(NodeKey::Start, input).await?;
        self.apply_routing(
            routed,
            &NodeKey::Start,
            &mut expected,
            &mut inbox,
            &mut started,
            &mut skipped,
            &mut join,
            &mut finished,
        )
        .await?;

        loop {
            if let Some(flow) = finished.take() {
                join.detach_all();
                return Ok(flow);
            }
            if join.is_empty() {
                return Err(ExecError::Stalled);
            }

            let next = tokio::select! {
                _ = self.cancel.cancelled() => None,
                next = join.join_next() => next,
            };
            let (key, result) = match next {
                Some(Ok(pair)) => pair,
                Some(Err(_)) | None => {
                    join.detach_all();
                    return Err(ExecError::Cancelled);
                }
            };

            let flow = match result {
                Ok(flow) => flow,
                Err(err) => {
                    // Fail fast: halt dispatch, let in-flight nodes run to
                    // completion detached, discard their outputs.
                    join.detach_all();
                    return Err(err);
                }
            };

            let routed = self.route_outputs(key.clone(), flow).await?;
            self.apply_routing(
                routed,
                &key,
                &mut expected,
                &mut inbox,
                &mut started,
                &mut skipped,
                &mut join,
                &mut finished,
            )
            .await?;
        }
    }

    /// Fold a routing result into the DAG state: buffer deliveries, prune
    /// deselected branch candidates (transitively), and dispatch every
    /// node whose predecessor set is settled.
    #[allow(clippy::too_many_arguments)]
    async fn apply_routing(
        &self,
        routed: Routed,
        from: &NodeKey,
        expected: &mut FxHashMap<NodeKey, FxHashSet<NodeKey>>,
        inbox: &mut FxHashMap<NodeKey, Vec<(NodeKey, Flow)>>,
        started: &mut FxHashSet<NodeKey>,
        skipped: &mut FxHashSet<NodeKey>,
        join: &mut JoinSet<(NodeKey, Result<Flow, ExecError>)>,
        finished: &mut Option<Flow>,
    ) -> Result<(), ExecError> {
        let mut settled: Vec<NodeKey> = Vec::new();

        for (to, flow) in routed.deliveries {
            if let Some(waiting) = expected.get_mut(&to) {
                waiting.remove(from);
            }
            inbox.entry(to.clone()).or_default().push((from.clone(), flow));
            if expected.get(&to).map_or(true, FxHashSet::is_empty) {
                settled.push(to);
            }
        }

        // A deselected candidate will never hear from `from`; if nothing
        // else can reach it either, it is skipped, and its own successors
        // stop waiting for it.
        let mut prune: Vec<(NodeKey, NodeKey)> = routed
            .deselected
            .into_iter()
            .map(|to| (from.clone(), to))
            .collect();
        while let Some((pred, to)) = prune.pop() {
            if let Some(waiting) = expected.get_mut(&to) {
                waiting.remove(&pred);
            }
            let unreached = inbox.get(&to).map_or(true, Vec::is_empty);
            if expected.get(&to).map_or(true, FxHashSet::is_empty) {
                if unreached {
                    if skipped.insert(to.clone()) {
                        tracing::debug!(node = %to, "branch deselection skips node");
                        for succ in self.plan.inner.succs.get(&to).into_iter().flatten() {
                            prune.push((to.clone(), succ.clone()));
                        }
                    }
                } else {
                    settled.push(to);
                }
            }
        }

        for to in settled {
            if started.contains(&to) || skipped.contains(&to) {
                continue;
            }
            started.insert(to.clone());
            let deliveries = inbox.remove(&to).unwrap_or_default();
            let input = self.assemble(&to, deliveries).await?;
            if to == NodeKey::End {
                *finished = Some(input);
                continue;
            }
            self.spawn_node(to, input, join);
        }
        Ok(())
    }

    // ----- Stepwise scheduling --------------------------------------------

    /// Bulk-synchronous execution for cyclic plans: within a super-step
    /// every node that received input runs in parallel; outputs are staged
    /// and applied atomically as the next step's inputs. Halts when `end`
    /// receives an input; exhausting `max_steps` is fatal.
    async fn run_stepwise(&self, input: Flow, max_steps: usize) -> Result<Flow, ExecError> {
        let routed = self.route_outputs(NodeKey::Start, input).await?;
        let mut inbox: FxHashMap<NodeKey, Vec<(NodeKey, Flow)>> = FxHashMap::default();
        for (to, flow) in routed.deliveries {
            inbox.entry(to).or_default().push((NodeKey::Start, flow));
        }

        let mut step: usize = 0;
        loop {
            if let Some(deliveries) = inbox.remove(&NodeKey::End) {
                return self.assemble(&NodeKey::End, deliveries).await;
            }
            if inbox.is_empty() {
                return Err(ExecError::Stalled);
            }
            step += 1;
            if step > max_steps {
                return Err(ExecError::StepLimitExceeded { limit: max_steps });
            }
            tracing::debug!(step, frontier = inbox.len(), "superstep");

            // Dispatch the whole frontier concurrently.
            let mut join: JoinSet<(NodeKey, Result<Flow, ExecError>)> = JoinSet::new();
            let frontier: Vec<NodeKey> = inbox.keys().cloned().collect();
            for key in frontier {
                let deliveries = inbox.remove(&key).unwrap_or_default();
                let input = self.assemble(&key, deliveries).await?;
                self.spawn_node(key, input, &mut join);
            }

            // Barrier: collect every output, then stage them together so
            // no node observes a partially applied super-step.
            let mut staged: Vec<(NodeKey, Flow)> = Vec::new();
            let mut failure: Option<ExecError> = None;
            loop {
                let cancelled = tokio::select! {
                    _ = self.cancel.cancelled() => true,
                    next = join.join_next() => match next {
                        None => break,
                        Some(Ok((key, Ok(flow)))) => {
                            staged.push((key, flow));
                            false
                        }
                        Some(Ok((_, Err(err)))) => {
                            failure = failure.or(Some(err));
                            false
                        }
                        Some(Err(_)) => {
                            failure = failure.or(Some(ExecError::Cancelled));
                            false
                        }
                    },
                };
                if cancelled {
                    join.detach_all();
                    return Err(ExecError::Cancelled);
                }
            }
            if let Some(err) = failure {
                return Err(err);
            }

            for (key, flow) in staged {
                let routed = self.route_outputs(key.clone(), flow).await?;
                for (to, routed_flow) in routed.deliveries {
                    inbox.entry(to).or_default().push((key.clone(), routed_flow));
                }
            }
        }
    }

    // ----- Shared node machinery ------------------------------------------

    /// Spawn one node invocation onto the worker pool. The computation is
    /// isolated behind its own task so panics in user code are captured
    /// and surfaced as structured errors.
    fn spawn_node(
        &self,
        key: NodeKey,
        input: Flow,
        join: &mut JoinSet<(NodeKey, Result<Flow, ExecError>)>,
    ) {
        let plan = self.plan.clone();
        let session = self.session.clone();
        let cancel = self.cancel.clone();
        let callbacks = self.callbacks.clone();
        join.spawn(async move {
            let result = run_node(plan, key.clone(), input, session, cancel, callbacks).await;
            (key, result)
        });
    }

    /// Evaluate branches and fan the output along all outgoing edges.
    async fn route_outputs(&self, from: NodeKey, flow: Flow) -> Result<Routed, ExecError> {
        let inner = &self.plan.inner;
        let succs = inner.succs.get(&from).cloned().unwrap_or_default();
        let branch_only: FxHashSet<NodeKey> = inner
            .branch_only_succs
            .get(&from)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default();
        let branches = inner.branches.get(&from).cloned().unwrap_or_default();

        let always: Vec<NodeKey> = succs
            .iter()
            .filter(|key| !branch_only.contains(key))
            .cloned()
            .collect();

        let (flow, selected, deselected) = self.evaluate_branches(&from, flow, &branches).await?;

        let mut recipients = always;
        for target in selected {
            if !recipients.contains(&target) {
                recipients.push(target);
            }
        }
        let deselected = deselected
            .into_iter()
            .filter(|key| !recipients.contains(key))
            .collect();

        let flows = flow.fan_out(recipients.len());
        Ok(Routed {
            deliveries: recipients.into_iter().zip(flows).collect(),
            deselected,
        })
    }

    /// Run every branch predicate attached to `from` against its output.
    ///
    /// Streaming outputs are copied once per predicate so each predicate
    /// consumes an independent reader; the original flow continues to the
    /// recipients. Selections outside the declared candidate set are
    /// dropped with a warning; an empty selection is fatal.
    async fn evaluate_branches(
        &self,
        from: &NodeKey,
        flow: Flow,
        branches: &[Branch],
    ) -> Result<(Flow, Vec<NodeKey>, Vec<NodeKey>), ExecError> {
        if branches.is_empty() {
            return Ok((flow, Vec::new(), Vec::new()));
        }

        let schema = self.producer_schema(from);
        let (main, mut predicate_flows) = match flow {
            Flow::Eager(value) => {
                let copies = (0..branches.len())
                    .map(|_| Flow::Eager(value.clone()))
                    .collect::<Vec<_>>();
                (Flow::Eager(value), copies)
            }
            Flow::Stream(reader) => {
                let mut copies = reader.copy(branches.len() + 1);
                let main = copies.pop().expect("copy yields requested readers");
                (Flow::Stream(main), copies.into_iter().map(Flow::Stream).collect())
            }
        };

        let mut selected: Vec<NodeKey> = Vec::new();
        let mut deselected: Vec<NodeKey> = Vec::new();
        for branch in branches {
            let predicate_flow = predicate_flows.pop().expect("one flow per branch");
            let picked = match (&branch.predicate, predicate_flow) {
                (BranchPredicate::Value(predicate), Flow::Eager(value)) => predicate(&value),
                (BranchPredicate::Value(predicate), Flow::Stream(reader)) => {
                    let value = concat_values(reader, &schema)
                        .await
                        .map_err(|err| ExecError::from_stream(from, err))?;
                    predicate(&value)
                }
                (BranchPredicate::Stream(predicate), Flow::Eager(value)) => {
                    predicate(StreamReader::of(value)).await
                }
                (BranchPredicate::Stream(predicate), Flow::Stream(reader)) => {
                    predicate(reader).await
                }
            }
            .map_err(|source| ExecError::NodeFailed {
                key: from.clone(),
                source,
            })?;

            let mut valid: Vec<NodeKey> = Vec::new();
            for target in picked {
                if branch.candidates().contains(&target) {
                    valid.push(target);
                } else {
                    tracing::warn!(
                        from = %from,
                        target = %target,
                        "branch selected a key outside its candidate set; skipping"
                    );
                }
            }
            if valid.is_empty() {
                return Err(ExecError::EmptyBranchSelection { key: from.clone() });
            }
            for candidate in branch.candidates() {
                if !valid.contains(candidate) && !deselected.contains(candidate) {
                    deselected.push(candidate.clone());
                }
            }
            for target in valid {
                if !selected.contains(&target) {
                    selected.push(target);
                }
            }
        }

        // A candidate deselected by one branch but selected by another
        // still runs.
        let deselected = deselected
            .into_iter()
            .filter(|key| !selected.contains(key))
            .collect();
        Ok((main, selected, deselected))
    }

    /// Assemble a node's input from its buffered deliveries.
    ///
    /// The sole-predecessor pass-through keeps a streaming carrier
    /// streaming; every other shape collapses streams to eager values
    /// first (the compiler guaranteed the concatenators exist), then
    /// merges under the compile-time strategy with deliveries ordered by
    /// the plan's predecessor order.
    async fn assemble(
        &self,
        key: &NodeKey,
        mut deliveries: Vec<(NodeKey, Flow)>,
    ) -> Result<Flow, ExecError> {
        let inner = &self.plan.inner;
        let node = inner.nodes.get(key);
        let default_merge = MergePlan::Single;
        let merge = inner.merges.get(key).unwrap_or(&default_merge);
        let input_key = node.and_then(|n| n.input_key.as_deref());
        let input_schema = node
            .map(|n| n.input_schema.clone())
            .unwrap_or_else(|| inner.output_schema.clone());

        // Sole-delivery pass-through: the merge of one input is that
        // input. Keeps a terminal stream streaming all the way to the
        // caller. Map-by-slot and user mergers still run so consumers
        // that expect the merged shape see it even with one delivery.
        let single_passthrough = deliveries.len() == 1
            && input_key.is_none()
            && (*key == NodeKey::End
                || !matches!(merge, MergePlan::MapBySlot | MergePlan::User(_)));
        if single_passthrough {
            let (pred, flow) = deliveries.remove(0);
            return Ok(self.coerce_flow(&pred, key, flow));
        }

        // Deterministic merge order: the plan's predecessor order, never
        // arrival order.
        let pred_order = inner.preds.get(key).cloned().unwrap_or_default();
        deliveries.sort_by_key(|(pred, _)| {
            pred_order
                .iter()
                .position(|p| p == pred)
                .unwrap_or(usize::MAX)
        });

        let mut ordered = Vec::with_capacity(deliveries.len());
        for (pred, flow) in deliveries {
            let flow = self.coerce_flow(&pred, key, flow);
            let value = match flow {
                Flow::Eager(value) => value,
                Flow::Stream(reader) => {
                    let schema = self.producer_schema(&pred);
                    concat_values(reader, &schema)
                        .await
                        .map_err(|err| ExecError::from_stream(key, err))?
                }
            };
            ordered.push(Delivery {
                slot: self.slot_name(&pred),
                pred,
                value,
            });
        }

        assemble_input(key, merge, ordered, input_key, &input_schema).map(Flow::Eager)
    }

    /// Apply the edge's registered coercion, chunk-wise for streams.
    fn coerce_flow(&self, from: &NodeKey, to: &NodeKey, flow: Flow) -> Flow {
        let Some(coerce) = self
            .plan
            .inner
            .coercions
            .get(&(from.clone(), to.clone()))
            .cloned()
        else {
            return flow;
        };
        match flow {
            Flow::Eager(value) => match coerce(value) {
                Ok(value) => Flow::Eager(value),
                Err(err) => Flow::Stream(StreamReader::failing(StreamError::failed(
                    err.to_string(),
                ))),
            },
            Flow::Stream(reader) => Flow::Stream(
                reader.map(move |chunk| coerce(chunk).map_err(|err| StreamError::failed(err.to_string()))),
            ),
        }
    }

    fn producer_schema(&self, key: &NodeKey) -> SchemaId {
        match key {
            NodeKey::Start => self.plan.inner.input_schema.clone(),
            other => self
                .plan
                .inner
                .nodes
                .get(other)
                .map(|n| n.output_schema.clone())
                .unwrap_or_else(SchemaId::json),
        }
    }

    fn slot_name(&self, pred: &NodeKey) -> Option<String> {
        self.plan
            .inner
            .nodes
            .get(pred)
            .and_then(|n| n.output_key.clone())
    }
}

/// Execute one node: adapt the input carrier to the node's native call
/// mode, run the computation behind a panic guard, invoke callbacks, and
/// return the output in its native carrier.
async fn run_node(
    plan: Plan,
    key: NodeKey,
    input: Flow,
    session: Arc<Session>,
    cancel: CancellationToken,
    callbacks: CallbackSet,
) -> Result<Flow, ExecError> {
    let node = plan
        .inner
        .nodes
        .get(&key)
        .ok_or_else(|| ExecError::MergeFailed {
            key: key.clone(),
            message: "node missing from plan".into(),
        })?;
    let computation = node.computation.clone();
    let component = node.component;
    let input_schema = node.input_schema.clone();
    let meta = NodeMeta::now(key.clone(), component);

    // Adapt the carrier to the node's native input mode.
    let native_input = if computation.streams_in() {
        match input {
            Flow::Stream(reader) => Flow::Stream(reader),
            Flow::Eager(value) => Flow::Stream(StreamReader::of(value)),
        }
    } else {
        match input {
            Flow::Eager(value) => Flow::Eager(value),
            Flow::Stream(reader) => {
                let value = concat_values(reader, &input_schema)
                    .await
                    .map_err(|err| ExecError::from_stream(&key, err))?;
                Flow::Eager(value)
            }
        }
    };

    // `on_start` sees (and may replace) eager inputs.
    let native_input = match native_input {
        Flow::Eager(value) => Flow::Eager(callbacks.start(&meta, value).await),
        stream => stream,
    };

    let ctx = ExecContext {
        node: key.clone(),
        session,
        cancel: cancel.clone(),
    };

    // The computation runs on its own task so a panic is contained and
    // reported against this node.
    let handle = tokio::spawn(async move {
        match (computation, native_input) {
            (Computation::Invoke(node), Flow::Eager(value)) => {
                node.invoke(ctx, value).await.map(Flow::Eager)
            }
            (Computation::Stream(node), Flow::Eager(value)) => {
                node.stream(ctx, value).await.map(Flow::Stream)
            }
            (Computation::Collect(node), Flow::Stream(reader)) => {
                node.collect(ctx, reader).await.map(Flow::Eager)
            }
            (Computation::Transform(node), Flow::Stream(reader)) => {
                node.transform(ctx, reader).await.map(Flow::Stream)
            }
            // The adapter above matched the carrier to the native mode.
            (Computation::Invoke(_) | Computation::Stream(_), Flow::Stream(_))
            | (Computation::Collect(_) | Computation::Transform(_), Flow::Eager(_)) => {
                unreachable!("input carrier adapted to the node's native call mode")
            }
        }
    });

    let outcome = match handle.await {
        Ok(Ok(flow)) => Ok(flow),
        Ok(Err(source)) => Err(ExecError::NodeFailed {
            key: key.clone(),
            source,
        }),
        Err(join_err) if join_err.is_panic() => {
            let payload = join_err.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic in node computation".to_string());
            Err(ExecError::NodePanicked {
                key: key.clone(),
                message,
            })
        }
        Err(_) => Err(ExecError::Cancelled),
    };

    match outcome {
        Ok(Flow::Eager(value)) => {
            let value = callbacks.end(&meta, value).await;
            Ok(Flow::Eager(value))
        }
        Ok(Flow::Stream(reader)) => Ok(Flow::Stream(callbacks.tee_chunks(meta, reader))),
        Err(err) => {
            callbacks.error(&meta, &err).await;
            Err(err)
        }
    }
}
