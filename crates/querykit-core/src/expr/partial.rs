//! Partial evaluation of locally computable sub-trees.

use super::eval::evaluate;
use super::node::{Bindings, Expr, Lambda, QueryOp};
use crate::error::Result;

/// Replaces every maximal locally evaluable sub-tree with a constant.
///
/// A sub-tree is local when the predicate accepts every node in it and it
/// contains no lambda parameter, table root or unbound variable. Evaluation
/// errors propagate to the caller.
pub struct PartialEvaluator<'a> {
    bindings: &'a Bindings,
    can_be_evaluated_locally: &'a dyn Fn(&Expr) -> bool,
}

impl<'a> PartialEvaluator<'a> {
    pub fn new(bindings: &'a Bindings, can_be_evaluated_locally: &'a dyn Fn(&Expr) -> bool) -> Self {
        Self {
            bindings,
            can_be_evaluated_locally,
        }
    }

    /// Evaluate `expr` against `bindings` with the given locality predicate.
    pub fn eval(
        expr: Expr,
        bindings: &Bindings,
        can_be_evaluated_locally: &dyn Fn(&Expr) -> bool,
    ) -> Result<Expr> {
        PartialEvaluator::new(bindings, can_be_evaluated_locally).rewrite(expr)
    }

    /// Check if the whole sub-tree can be computed without the query.
    pub fn is_local(&self, expr: &Expr) -> bool {
        if !(self.can_be_evaluated_locally)(expr) {
            return false;
        }
        match expr {
            Expr::Constant(_) => true,
            Expr::Variable(name) => self.bindings.contains(name),
            Expr::Parameter(_) | Expr::Table(_) | Expr::Query(_) | Expr::New(_) => false,
            Expr::Member(..) => false,
            Expr::Binary(_, l, r) => self.is_local(l) && self.is_local(r),
            Expr::Unary(_, e) => self.is_local(e),
            Expr::Conditional(t, a, b) => self.is_local(t) && self.is_local(a) && self.is_local(b),
            Expr::Call(_, args) => args.iter().all(|a| self.is_local(a)),
        }
    }

    pub fn rewrite(&self, expr: Expr) -> Result<Expr> {
        if !matches!(expr, Expr::Constant(_)) && self.is_local(&expr) {
            return Ok(Expr::Constant(evaluate(&expr, self.bindings)?));
        }
        let expr = match expr {
            Expr::Member(inner, name) => Expr::Member(Box::new(self.rewrite(*inner)?), name),
            Expr::Binary(op, l, r) => {
                Expr::Binary(op, Box::new(self.rewrite(*l)?), Box::new(self.rewrite(*r)?))
            }
            Expr::Unary(op, e) => Expr::Unary(op, Box::new(self.rewrite(*e)?)),
            Expr::Conditional(t, a, b) => Expr::Conditional(
                Box::new(self.rewrite(*t)?),
                Box::new(self.rewrite(*a)?),
                Box::new(self.rewrite(*b)?),
            ),
            Expr::Call(f, args) => Expr::Call(
                f,
                args.into_iter()
                    .map(|a| self.rewrite(a))
                    .collect::<Result<_>>()?,
            ),
            Expr::New(fields) => Expr::New(
                fields
                    .into_iter()
                    .map(|(n, e)| Ok((n, self.rewrite(e)?)))
                    .collect::<Result<_>>()?,
            ),
            Expr::Query(op) => Expr::Query(Box::new(self.rewrite_op(*op)?)),
            leaf => leaf,
        };
        Ok(expr)
    }

    fn lambda(&self, lambda: Lambda) -> Result<Lambda> {
        Ok(Lambda {
            parameters: lambda.parameters,
            body: Box::new(self.rewrite(*lambda.body)?),
        })
    }

    fn opt_lambda(&self, lambda: Option<Lambda>) -> Result<Option<Lambda>> {
        lambda.map(|l| self.lambda(l)).transpose()
    }

    fn rewrite_op(&self, op: QueryOp) -> Result<QueryOp> {
        let op = match op {
            QueryOp::Where { source, predicate } => QueryOp::Where {
                source: self.rewrite(source)?,
                predicate: self.lambda(predicate)?,
            },
            QueryOp::Select { source, selector } => QueryOp::Select {
                source: self.rewrite(source)?,
                selector: self.lambda(selector)?,
            },
            QueryOp::SelectMany {
                source,
                collection,
                result,
            } => QueryOp::SelectMany {
                source: self.rewrite(source)?,
                collection: self.lambda(collection)?,
                result: self.opt_lambda(result)?,
            },
            QueryOp::Join {
                outer,
                inner,
                outer_key,
                inner_key,
                result,
            } => QueryOp::Join {
                outer: self.rewrite(outer)?,
                inner: self.rewrite(inner)?,
                outer_key: self.lambda(outer_key)?,
                inner_key: self.lambda(inner_key)?,
                result: self.lambda(result)?,
            },
            QueryOp::GroupJoin {
                outer,
                inner,
                outer_key,
                inner_key,
                result,
            } => QueryOp::GroupJoin {
                outer: self.rewrite(outer)?,
                inner: self.rewrite(inner)?,
                outer_key: self.lambda(outer_key)?,
                inner_key: self.lambda(inner_key)?,
                result: self.lambda(result)?,
            },
            QueryOp::OrderBy {
                source,
                key,
                descending,
            } => QueryOp::OrderBy {
                source: self.rewrite(source)?,
                key: self.lambda(key)?,
                descending,
            },
            QueryOp::ThenBy {
                source,
                key,
                descending,
            } => QueryOp::ThenBy {
                source: self.rewrite(source)?,
                key: self.lambda(key)?,
                descending,
            },
            QueryOp::GroupBy {
                source,
                key,
                element,
                result,
            } => QueryOp::GroupBy {
                source: self.rewrite(source)?,
                key: self.lambda(key)?,
                element: self.opt_lambda(element)?,
                result: self.opt_lambda(result)?,
            },
            QueryOp::Aggregate {
                source,
                kind,
                selector,
            } => QueryOp::Aggregate {
                source: self.rewrite(source)?,
                kind,
                selector: self.opt_lambda(selector)?,
            },
            QueryOp::Take { source, count } => QueryOp::Take {
                source: self.rewrite(source)?,
                count: self.rewrite(count)?,
            },
            QueryOp::Skip { source, count } => QueryOp::Skip {
                source: self.rewrite(source)?,
                count: self.rewrite(count)?,
            },
            QueryOp::Distinct { source } => QueryOp::Distinct {
                source: self.rewrite(source)?,
            },
            QueryOp::Reverse { source } => QueryOp::Reverse {
                source: self.rewrite(source)?,
            },
            QueryOp::First {
                source,
                predicate,
                or_default,
            } => QueryOp::First {
                source: self.rewrite(source)?,
                predicate: self.opt_lambda(predicate)?,
                or_default,
            },
            QueryOp::Single {
                source,
                predicate,
                or_default,
            } => QueryOp::Single {
                source: self.rewrite(source)?,
                predicate: self.opt_lambda(predicate)?,
                or_default,
            },
            QueryOp::Any { source, predicate } => QueryOp::Any {
                source: self.rewrite(source)?,
                predicate: self.opt_lambda(predicate)?,
            },
            QueryOp::All { source, predicate } => QueryOp::All {
                source: self.rewrite(source)?,
                predicate: self.lambda(predicate)?,
            },
            QueryOp::Contains { source, item } => QueryOp::Contains {
                source: self.rewrite(source)?,
                item: self.rewrite(item)?,
            },
        };
        Ok(op)
    }
}
