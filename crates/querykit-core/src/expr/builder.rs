//! Fluent construction of logical queries.
//!
//! ```ignore
//! use querykit_core::expr::{Expr, Lambda};
//!
//! let query = Expr::table("Customer")
//!     .filter(Lambda::new("c", Expr::param("c").member("City").equals(Expr::var("city"))))
//!     .order_by(Lambda::new("c", Expr::param("c").member("CustomerID")));
//! ```

use querykit_proto::Value;

use super::node::{AggregateKind, BinaryOp, Expr, Lambda, QueryOp, ScalarFunction, UnaryOp};

impl Expr {
    /// All rows of a mapped entity.
    pub fn table(entity: impl Into<String>) -> Self {
        Expr::Table(entity.into())
    }

    pub fn param(name: impl Into<String>) -> Self {
        Expr::Parameter(name.into())
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Variable(name.into())
    }

    pub fn constant(value: impl Into<Value>) -> Self {
        Expr::Constant(value.into())
    }

    pub fn null() -> Self {
        Expr::Constant(Value::Null)
    }

    /// Anonymous record with the given named fields.
    pub fn record<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, Expr)>,
        S: Into<String>,
    {
        Expr::New(fields.into_iter().map(|(n, e)| (n.into(), e)).collect())
    }

    pub fn member(self, name: impl Into<String>) -> Self {
        Expr::Member(Box::new(self), name.into())
    }

    pub fn binary(self, op: BinaryOp, other: impl Into<Expr>) -> Self {
        Expr::Binary(op, Box::new(self), Box::new(other.into()))
    }

    pub fn equals(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Equal, other)
    }

    pub fn not_equals(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::NotEqual, other)
    }

    pub fn less_than(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::LessThan, other)
    }

    pub fn less_or_equal(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::LessThanOrEqual, other)
    }

    pub fn greater_than(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::GreaterThan, other)
    }

    pub fn greater_or_equal(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::GreaterThanOrEqual, other)
    }

    pub fn and(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::And, other)
    }

    pub fn or(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Or, other)
    }

    pub fn add(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Add, other)
    }

    pub fn sub(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Subtract, other)
    }

    pub fn mul(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Multiply, other)
    }

    pub fn div(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Divide, other)
    }

    pub fn not(self) -> Self {
        Expr::Unary(UnaryOp::Not, Box::new(self))
    }

    pub fn negate(self) -> Self {
        Expr::Unary(UnaryOp::Negate, Box::new(self))
    }

    pub fn call(function: ScalarFunction, args: Vec<Expr>) -> Self {
        Expr::Call(function, args)
    }

    pub fn condition(test: Expr, if_true: Expr, if_false: Expr) -> Self {
        Expr::Conditional(Box::new(test), Box::new(if_true), Box::new(if_false))
    }

    fn op(op: QueryOp) -> Self {
        Expr::Query(Box::new(op))
    }

    pub fn filter(self, predicate: Lambda) -> Self {
        Self::op(QueryOp::Where {
            source: self,
            predicate,
        })
    }

    pub fn select(self, selector: Lambda) -> Self {
        Self::op(QueryOp::Select {
            source: self,
            selector,
        })
    }

    pub fn select_many(self, collection: Lambda, result: Option<Lambda>) -> Self {
        Self::op(QueryOp::SelectMany {
            source: self,
            collection,
            result,
        })
    }

    pub fn join(self, inner: Expr, outer_key: Lambda, inner_key: Lambda, result: Lambda) -> Self {
        Self::op(QueryOp::Join {
            outer: self,
            inner,
            outer_key,
            inner_key,
            result,
        })
    }

    pub fn group_join(
        self,
        inner: Expr,
        outer_key: Lambda,
        inner_key: Lambda,
        result: Lambda,
    ) -> Self {
        Self::op(QueryOp::GroupJoin {
            outer: self,
            inner,
            outer_key,
            inner_key,
            result,
        })
    }

    pub fn order_by(self, key: Lambda) -> Self {
        Self::op(QueryOp::OrderBy {
            source: self,
            key,
            descending: false,
        })
    }

    pub fn order_by_descending(self, key: Lambda) -> Self {
        Self::op(QueryOp::OrderBy {
            source: self,
            key,
            descending: true,
        })
    }

    pub fn then_by(self, key: Lambda) -> Self {
        Self::op(QueryOp::ThenBy {
            source: self,
            key,
            descending: false,
        })
    }

    pub fn then_by_descending(self, key: Lambda) -> Self {
        Self::op(QueryOp::ThenBy {
            source: self,
            key,
            descending: true,
        })
    }

    pub fn group_by(self, key: Lambda) -> Self {
        Self::op(QueryOp::GroupBy {
            source: self,
            key,
            element: None,
            result: None,
        })
    }

    /// Group with an element selector and/or a `(key, group)` result selector.
    pub fn group_by_with(self, key: Lambda, element: Option<Lambda>, result: Option<Lambda>) -> Self {
        Self::op(QueryOp::GroupBy {
            source: self,
            key,
            element,
            result,
        })
    }

    pub fn aggregate(self, kind: AggregateKind, selector: Option<Lambda>) -> Self {
        Self::op(QueryOp::Aggregate {
            source: self,
            kind,
            selector,
        })
    }

    pub fn count(self) -> Self {
        self.aggregate(AggregateKind::Count, None)
    }

    pub fn sum(self, selector: Lambda) -> Self {
        self.aggregate(AggregateKind::Sum, Some(selector))
    }

    pub fn min(self, selector: Lambda) -> Self {
        self.aggregate(AggregateKind::Min, Some(selector))
    }

    pub fn max(self, selector: Lambda) -> Self {
        self.aggregate(AggregateKind::Max, Some(selector))
    }

    pub fn average(self, selector: Lambda) -> Self {
        self.aggregate(AggregateKind::Average, Some(selector))
    }

    pub fn take(self, count: impl Into<Expr>) -> Self {
        Self::op(QueryOp::Take {
            source: self,
            count: count.into(),
        })
    }

    pub fn skip(self, count: impl Into<Expr>) -> Self {
        Self::op(QueryOp::Skip {
            source: self,
            count: count.into(),
        })
    }

    pub fn distinct(self) -> Self {
        Self::op(QueryOp::Distinct { source: self })
    }

    pub fn reverse(self) -> Self {
        Self::op(QueryOp::Reverse { source: self })
    }

    pub fn first(self) -> Self {
        Self::op(QueryOp::First {
            source: self,
            predicate: None,
            or_default: false,
        })
    }

    pub fn first_or_default(self) -> Self {
        Self::op(QueryOp::First {
            source: self,
            predicate: None,
            or_default: true,
        })
    }

    pub fn first_where(self, predicate: Lambda) -> Self {
        Self::op(QueryOp::First {
            source: self,
            predicate: Some(predicate),
            or_default: false,
        })
    }

    pub fn single(self) -> Self {
        Self::op(QueryOp::Single {
            source: self,
            predicate: None,
            or_default: false,
        })
    }

    pub fn single_or_default(self) -> Self {
        Self::op(QueryOp::Single {
            source: self,
            predicate: None,
            or_default: true,
        })
    }

    pub fn any(self) -> Self {
        Self::op(QueryOp::Any {
            source: self,
            predicate: None,
        })
    }

    pub fn any_where(self, predicate: Lambda) -> Self {
        Self::op(QueryOp::Any {
            source: self,
            predicate: Some(predicate),
        })
    }

    pub fn all(self, predicate: Lambda) -> Self {
        Self::op(QueryOp::All {
            source: self,
            predicate,
        })
    }

    pub fn contains(self, item: impl Into<Expr>) -> Self {
        Self::op(QueryOp::Contains {
            source: self,
            item: item.into(),
        })
    }
}

impl From<Value> for Expr {
    fn from(v: Value) -> Self {
        Expr::Constant(v)
    }
}

impl From<bool> for Expr {
    fn from(v: bool) -> Self {
        Expr::Constant(v.into())
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Self {
        Expr::Constant(v.into())
    }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Self {
        Expr::Constant(v.into())
    }
}

impl From<f64> for Expr {
    fn from(v: f64) -> Self {
        Expr::Constant(v.into())
    }
}

impl From<&str> for Expr {
    fn from(v: &str) -> Self {
        Expr::Constant(v.into())
    }
}

impl From<String> for Expr {
    fn from(v: String) -> Self {
        Expr::Constant(v.into())
    }
}
