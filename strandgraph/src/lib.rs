//! ```text
//! Graph ─┬─► Graph::compile ─► Plan ─► Engine
//!        │                     │        │
//!        │                     │        ├─► nodes (4 call modes) ─► stream substrate
//!        │                     │        │                            (pipe / copy / concat)
//!        │                     │        ├─► fan-in merge ─► CallbackSet hooks
//!        │                     │        └─► Session (values / interrupt ctxs)
//!        │                     │
//!        │                     └─► GraphInfo ─► Mermaid export
//!        │
//!        └─► TypeRegistry & coercions wire compatibility end-to-end
//! ```
//!
//! Strandgraph is the compiled directed-graph execution core of a
//! composable agent runtime: user-declared graphs of computations (chat
//! models, tool executors, lambdas, embedded graphs) are validated and
//! lowered into immutable plans, then executed with concurrent
//! scheduling, streaming edges, cooperative cancellation, and fail-fast
//! error propagation. A prebuilt ReAct loop ([`agent::ReactAgent`])
//! sits on top of the same machinery.

pub mod agent;
pub mod callback;
pub mod graph;
pub mod runtime;
pub mod schema;
pub mod stream;
