//! Compiled execution plans.

use std::fmt::Write as _;
use std::sync::Arc;

use querykit_proto::{DbQueryType, QueryCommand, Value};

use crate::expr::{BinaryOp, ScalarFunction, UnaryOp};
use crate::ir::{Aggregator, Select, SqlExpr};

/// Where a command parameter's value comes from at execution time.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    /// Inline value of the query.
    Constant(Value),
    /// Runtime variable, looked up in the execution bindings.
    Variable(String),
    /// Value of the enclosing row a nested command is correlated with.
    Outer(Reader),
}

/// Builds one client object from a result row.
#[derive(Debug, Clone, PartialEq)]
pub enum Reader {
    /// Column at `index`, coerced to its declared type.
    Field {
        index: usize,
        db_type: Option<DbQueryType>,
    },
    Constant(Value),
    Variable(String),
    Binary(BinaryOp, Box<Reader>, Box<Reader>),
    Unary(UnaryOp, Box<Reader>),
    Call(ScalarFunction, Vec<Reader>),
    Case(Box<Reader>, Box<Reader>, Box<Reader>),
    IsNull(Box<Reader>),
    Record {
        entity: Option<String>,
        fields: Vec<(String, Reader)>,
    },
    /// Null when `test` reads null, the value of `reader` otherwise.
    OuterJoined {
        test: Box<Reader>,
        reader: Box<Reader>,
    },
    Grouping {
        key: Box<Reader>,
        elements: Box<Reader>,
    },
    /// Collection or singleton queried once per row.
    Nested(Arc<QueryPlan>),
    /// Collection queried once per batch of rows.
    ClientJoin(Arc<ClientJoinPlan>),
    /// Relationship captured for loading on access.
    Deferred(Arc<QueryPlan>),
}

impl Reader {
    /// Check if reading a row runs further commands.
    pub fn runs_commands(&self) -> bool {
        match self {
            Reader::Nested(_) | Reader::ClientJoin(_) => true,
            Reader::Field { .. } | Reader::Constant(_) | Reader::Variable(_) | Reader::Deferred(_) => false,
            Reader::Binary(_, l, r) => l.runs_commands() || r.runs_commands(),
            Reader::Unary(_, r) | Reader::IsNull(r) => r.runs_commands(),
            Reader::Call(_, args) => args.iter().any(Reader::runs_commands),
            Reader::Case(a, b, c) => a.runs_commands() || b.runs_commands() || c.runs_commands(),
            Reader::Record { fields, .. } => fields.iter().any(|(_, r)| r.runs_commands()),
            Reader::OuterJoined { test, reader } => test.runs_commands() || reader.runs_commands(),
            Reader::Grouping { key, elements } => key.runs_commands() || elements.runs_commands(),
        }
    }

    /// The client joins reached from this reader without crossing a nested plan.
    pub(crate) fn client_joins(&self) -> Vec<&Arc<ClientJoinPlan>> {
        let mut out = Vec::new();
        self.collect_client_joins(&mut out);
        out
    }

    fn collect_client_joins<'r>(&'r self, out: &mut Vec<&'r Arc<ClientJoinPlan>>) {
        match self {
            Reader::ClientJoin(plan) => out.push(plan),
            Reader::Binary(_, l, r) => {
                l.collect_client_joins(out);
                r.collect_client_joins(out);
            }
            Reader::Unary(_, r) | Reader::IsNull(r) => r.collect_client_joins(out),
            Reader::Call(_, args) => args.iter().for_each(|a| a.collect_client_joins(out)),
            Reader::Case(a, b, c) => {
                a.collect_client_joins(out);
                b.collect_client_joins(out);
                c.collect_client_joins(out);
            }
            Reader::Record { fields, .. } => fields.iter().for_each(|(_, r)| r.collect_client_joins(out)),
            Reader::OuterJoined { test, reader } => {
                test.collect_client_joins(out);
                reader.collect_client_joins(out);
            }
            Reader::Grouping { key, elements } => {
                key.collect_client_joins(out);
                elements.collect_client_joins(out);
            }
            Reader::Field { .. }
            | Reader::Constant(_)
            | Reader::Variable(_)
            | Reader::Nested(_)
            | Reader::Deferred(_) => {}
        }
    }

    fn describe(&self, depth: usize, out: &mut String) {
        match self {
            Reader::Nested(plan) => {
                let _ = writeln!(out, "{}nested, per row:", indent(depth));
                plan.describe_into(depth + 1, out);
            }
            Reader::Deferred(plan) => {
                let _ = writeln!(out, "{}deferred:", indent(depth));
                plan.describe_into(depth + 1, out);
            }
            Reader::ClientJoin(join) => {
                let _ = writeln!(
                    out,
                    "{}client join on {} key(s), batched:",
                    indent(depth),
                    join.outer_key.len()
                );
                let _ = writeln!(out, "{}{}", indent(depth + 1), join.command.text);
                join.reader.describe(depth + 1, out);
            }
            Reader::Record { fields, .. } => fields.iter().for_each(|(_, r)| r.describe(depth, out)),
            Reader::OuterJoined { reader, .. } => reader.describe(depth, out),
            Reader::Grouping { elements, .. } => elements.describe(depth, out),
            _ => {}
        }
    }

    fn collect_commands<'p>(&'p self, out: &mut Vec<&'p QueryCommand>) {
        match self {
            Reader::Nested(plan) | Reader::Deferred(plan) => plan.collect_commands(out),
            Reader::ClientJoin(join) => {
                out.push(&join.command);
                join.reader.collect_commands(out);
            }
            Reader::Record { fields, .. } => fields.iter().for_each(|(_, r)| r.collect_commands(out)),
            Reader::OuterJoined { reader, .. } => reader.collect_commands(out),
            Reader::Grouping { elements, .. } => elements.collect_commands(out),
            _ => {}
        }
    }
}

/// One command and the reader that turns its rows into objects.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub command: QueryCommand,
    /// Parameter sources, in `command.parameters` order.
    pub arguments: Vec<Argument>,
    pub reader: Reader,
    pub aggregator: Option<Aggregator>,
    /// Objects are built while the command's rows are read. Plans that run
    /// further commands per row read all rows first.
    pub streaming: bool,
}

impl QueryPlan {
    /// Every command the plan can run, outermost first.
    pub fn commands(&self) -> Vec<&QueryCommand> {
        let mut out = Vec::new();
        self.collect_commands(&mut out);
        out
    }

    fn collect_commands<'p>(&'p self, out: &mut Vec<&'p QueryCommand>) {
        out.push(&self.command);
        self.reader.collect_commands(out);
    }

    /// Readable outline of the commands and how their results are combined.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        self.describe_into(0, &mut out);
        out
    }

    fn describe_into(&self, depth: usize, out: &mut String) {
        let mode = if self.streaming { "streamed" } else { "materialized" };
        let shape = match self.aggregator {
            None => "sequence".to_string(),
            Some(a) => format!("{:?}", a),
        };
        let _ = writeln!(out, "{}query ({}, {}):", indent(depth), shape, mode);
        for line in self.command.text.lines() {
            let _ = writeln!(out, "{}{}", indent(depth + 1), line);
        }
        for (parameter, argument) in self.command.parameters.iter().zip(&self.arguments) {
            let source = match argument {
                Argument::Constant(v) => format!("constant {}", v),
                Argument::Variable(name) => format!("variable {}", name),
                Argument::Outer(_) => "outer row".to_string(),
            };
            let _ = writeln!(out, "{}{} {} <- {}", indent(depth + 1), parameter.name, parameter.db_type, source);
        }
        self.reader.describe(depth + 1, out);
    }
}

/// A nested collection loaded for many parent rows at once.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientJoinPlan {
    /// The collection query without key filter, extended per batch.
    pub select: Select,
    /// Server-side inner key expressions over `select`'s sources.
    pub key_exprs: Vec<SqlExpr>,
    /// Representative command: the query filtered on one parent's key.
    pub command: QueryCommand,
    pub reader: Reader,
    pub aggregator: Option<Aggregator>,
    /// Key read from each parent row.
    pub outer_key: Vec<Reader>,
    /// Key read from each collection row.
    pub inner_key: Vec<Reader>,
}

fn indent(depth: usize) -> String {
    "  ".repeat(depth)
}
