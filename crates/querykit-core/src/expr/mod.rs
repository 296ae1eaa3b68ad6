//! Logical expression model.
//!
//! Queries are built as [`Expr`] trees over mapped entities, evaluated
//! partially against caller [`Bindings`], then handed to the translator.

mod builder;
pub mod eval;
mod node;
mod partial;

pub use node::{
    AggregateKind, BinaryOp, Bindings, Expr, Lambda, QueryOp, ScalarFunction, UnaryOp,
};
pub use partial::PartialEvaluator;

impl Expr {
    /// Replace every occurrence of `target` with `replacement`.
    pub fn replace(self, target: &Expr, replacement: &Expr) -> Expr {
        if &self == target {
            return replacement.clone();
        }
        let r = |e: Expr| e.replace(target, replacement);
        let rl = |l: Lambda| Lambda {
            parameters: l.parameters,
            body: Box::new(l.body.replace(target, replacement)),
        };
        match self {
            Expr::Member(inner, name) => Expr::Member(Box::new(r(*inner)), name),
            Expr::Binary(op, a, b) => Expr::Binary(op, Box::new(r(*a)), Box::new(r(*b))),
            Expr::Unary(op, a) => Expr::Unary(op, Box::new(r(*a))),
            Expr::Conditional(t, a, b) => {
                Expr::Conditional(Box::new(r(*t)), Box::new(r(*a)), Box::new(r(*b)))
            }
            Expr::Call(f, args) => Expr::Call(f, args.into_iter().map(r).collect()),
            Expr::New(fields) => Expr::New(fields.into_iter().map(|(n, e)| (n, r(e))).collect()),
            Expr::Query(op) => Expr::Query(Box::new(op.map(&r, &rl))),
            leaf => leaf,
        }
    }
}

impl QueryOp {
    /// Rebuild the operator, mapping every child expression and lambda.
    pub fn map<F, G>(self, f: &F, g: &G) -> QueryOp
    where
        F: Fn(Expr) -> Expr,
        G: Fn(Lambda) -> Lambda,
    {
        match self {
            QueryOp::Where { source, predicate } => QueryOp::Where {
                source: f(source),
                predicate: g(predicate),
            },
            QueryOp::Select { source, selector } => QueryOp::Select {
                source: f(source),
                selector: g(selector),
            },
            QueryOp::SelectMany {
                source,
                collection,
                result,
            } => QueryOp::SelectMany {
                source: f(source),
                collection: g(collection),
                result: result.map(g),
            },
            QueryOp::Join {
                outer,
                inner,
                outer_key,
                inner_key,
                result,
            } => QueryOp::Join {
                outer: f(outer),
                inner: f(inner),
                outer_key: g(outer_key),
                inner_key: g(inner_key),
                result: g(result),
            },
            QueryOp::GroupJoin {
                outer,
                inner,
                outer_key,
                inner_key,
                result,
            } => QueryOp::GroupJoin {
                outer: f(outer),
                inner: f(inner),
                outer_key: g(outer_key),
                inner_key: g(inner_key),
                result: g(result),
            },
            QueryOp::OrderBy {
                source,
                key,
                descending,
            } => QueryOp::OrderBy {
                source: f(source),
                key: g(key),
                descending,
            },
            QueryOp::ThenBy {
                source,
                key,
                descending,
            } => QueryOp::ThenBy {
                source: f(source),
                key: g(key),
                descending,
            },
            QueryOp::GroupBy {
                source,
                key,
                element,
                result,
            } => QueryOp::GroupBy {
                source: f(source),
                key: g(key),
                element: element.map(g),
                result: result.map(g),
            },
            QueryOp::Aggregate {
                source,
                kind,
                selector,
            } => QueryOp::Aggregate {
                source: f(source),
                kind,
                selector: selector.map(g),
            },
            QueryOp::Take { source, count } => QueryOp::Take {
                source: f(source),
                count: f(count),
            },
            QueryOp::Skip { source, count } => QueryOp::Skip {
                source: f(source),
                count: f(count),
            },
            QueryOp::Distinct { source } => QueryOp::Distinct { source: f(source) },
            QueryOp::Reverse { source } => QueryOp::Reverse { source: f(source) },
            QueryOp::First {
                source,
                predicate,
                or_default,
            } => QueryOp::First {
                source: f(source),
                predicate: predicate.map(g),
                or_default,
            },
            QueryOp::Single {
                source,
                predicate,
                or_default,
            } => QueryOp::Single {
                source: f(source),
                predicate: predicate.map(g),
                or_default,
            },
            QueryOp::Any { source, predicate } => QueryOp::Any {
                source: f(source),
                predicate: predicate.map(g),
            },
            QueryOp::All { source, predicate } => QueryOp::All {
                source: f(source),
                predicate: g(predicate),
            },
            QueryOp::Contains { source, item } => QueryOp::Contains {
                source: f(source),
                item: f(item),
            },
        }
    }
}
