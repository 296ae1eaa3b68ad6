//! Execution plans: compiling projections into commands and readers, and
//! running them.
//!
//! A [`QueryPlan`] holds the rendered command, where each parameter value
//! comes from, and a [`Reader`](plan::Reader) tree that builds one client
//! [`Object`] per row. Nested collections run either once per parent row or,
//! when client-joined, once per batch of parent keys.

mod builder;
mod executor;
mod object;
pub mod plan;

use std::fmt;

pub use builder::ExecutionBuilder;
pub use executor::{aggregate, Executor};
pub use object::{Deferred, FromObject, Grouping, Object, Record, ToRecord};
pub use plan::{Argument, ClientJoinPlan, QueryPlan, Reader};

/// Lifecycle of one query execution, as reported in trace logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryState {
    NotTranslated,
    Translating,
    PlanBuilt,
    Executing,
    /// Objects built while rows were read.
    Streaming,
    /// All rows read before objects were built.
    Materialized,
    Done,
    Failed,
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryState::NotTranslated => "not-translated",
            QueryState::Translating => "translating",
            QueryState::PlanBuilt => "plan-built",
            QueryState::Executing => "executing",
            QueryState::Streaming => "streaming",
            QueryState::Materialized => "materialized",
            QueryState::Done => "done",
            QueryState::Failed => "failed",
        };
        f.write_str(name)
    }
}
