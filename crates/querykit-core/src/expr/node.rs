//! Logical query expression nodes.

use std::collections::HashMap;

use querykit_proto::Value;

/// Binary operators shared by logical expressions and the relational IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    And,
    Or,
}

impl BinaryOp {
    /// Check if the operator compares its operands.
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::LessThan
                | BinaryOp::LessThanOrEqual
                | BinaryOp::GreaterThan
                | BinaryOp::GreaterThanOrEqual
        )
    }

    /// Check if the operator is AND or OR.
    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    /// The operator that compares in the opposite direction.
    pub fn flipped(&self) -> BinaryOp {
        match self {
            BinaryOp::LessThan => BinaryOp::GreaterThan,
            BinaryOp::LessThanOrEqual => BinaryOp::GreaterThanOrEqual,
            BinaryOp::GreaterThan => BinaryOp::LessThan,
            BinaryOp::GreaterThanOrEqual => BinaryOp::LessThanOrEqual,
            other => *other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Negate,
}

/// Scalar functions callable from queries and evaluable on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarFunction {
    Upper,
    Lower,
    Length,
    Trim,
    Concat,
    Substring,
    StartsWith,
    EndsWith,
    Contains,
    Abs,
    Round,
    Coalesce,
}

/// Sequence aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    Count,
    LongCount,
    Sum,
    Min,
    Max,
    Average,
}

impl AggregateKind {
    /// Check if the aggregate needs a value selector (`Sum(x => ...)`).
    pub fn has_argument(&self) -> bool {
        !matches!(self, AggregateKind::Count | AggregateKind::LongCount)
    }
}

/// A lambda: named parameters and a body.
#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    pub parameters: Vec<String>,
    pub body: Box<Expr>,
}

impl Lambda {
    /// One-parameter lambda.
    pub fn new(parameter: impl Into<String>, body: Expr) -> Self {
        Self {
            parameters: vec![parameter.into()],
            body: Box::new(body),
        }
    }

    /// Two-parameter lambda, used by join and group result selectors.
    pub fn new2(first: impl Into<String>, second: impl Into<String>, body: Expr) -> Self {
        Self {
            parameters: vec![first.into(), second.into()],
            body: Box::new(body),
        }
    }

    /// The first parameter name.
    pub fn parameter(&self) -> &str {
        self.parameters.first().map(String::as_str).unwrap_or("")
    }
}

/// Logical expression tree.
///
/// Query roots are [`Expr::Table`] nodes; sequence operators live in
/// [`QueryOp`]. Runtime values captured by the caller are [`Expr::Variable`]
/// nodes resolved through [`Bindings`].
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Constant(Value),
    /// Reference to a lambda parameter.
    Parameter(String),
    /// Captured runtime value.
    Variable(String),
    Member(Box<Expr>, String),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(ScalarFunction, Vec<Expr>),
    /// Anonymous record construction.
    New(Vec<(String, Expr)>),
    /// All rows of a mapped entity.
    Table(String),
    Query(Box<QueryOp>),
}

/// Sequence operators.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOp {
    Where {
        source: Expr,
        predicate: Lambda,
    },
    Select {
        source: Expr,
        selector: Lambda,
    },
    SelectMany {
        source: Expr,
        collection: Lambda,
        result: Option<Lambda>,
    },
    Join {
        outer: Expr,
        inner: Expr,
        outer_key: Lambda,
        inner_key: Lambda,
        result: Lambda,
    },
    GroupJoin {
        outer: Expr,
        inner: Expr,
        outer_key: Lambda,
        inner_key: Lambda,
        result: Lambda,
    },
    OrderBy {
        source: Expr,
        key: Lambda,
        descending: bool,
    },
    ThenBy {
        source: Expr,
        key: Lambda,
        descending: bool,
    },
    /// Group rows by key.
    ///
    /// When the result enumerates raw group members instead of aggregating
    /// them, each group's members are fetched by a per-group query. Prefer
    /// aggregates over the group for large inputs.
    GroupBy {
        source: Expr,
        key: Lambda,
        element: Option<Lambda>,
        result: Option<Lambda>,
    },
    Aggregate {
        source: Expr,
        kind: AggregateKind,
        selector: Option<Lambda>,
    },
    Take {
        source: Expr,
        count: Expr,
    },
    Skip {
        source: Expr,
        count: Expr,
    },
    Distinct {
        source: Expr,
    },
    Reverse {
        source: Expr,
    },
    First {
        source: Expr,
        predicate: Option<Lambda>,
        or_default: bool,
    },
    Single {
        source: Expr,
        predicate: Option<Lambda>,
        or_default: bool,
    },
    Any {
        source: Expr,
        predicate: Option<Lambda>,
    },
    All {
        source: Expr,
        predicate: Lambda,
    },
    Contains {
        source: Expr,
        item: Expr,
    },
}

impl QueryOp {
    /// The sequence this operator reads from (the outer sequence for joins).
    pub fn source(&self) -> &Expr {
        match self {
            QueryOp::Where { source, .. }
            | QueryOp::Select { source, .. }
            | QueryOp::SelectMany { source, .. }
            | QueryOp::OrderBy { source, .. }
            | QueryOp::ThenBy { source, .. }
            | QueryOp::GroupBy { source, .. }
            | QueryOp::Aggregate { source, .. }
            | QueryOp::Take { source, .. }
            | QueryOp::Skip { source, .. }
            | QueryOp::Distinct { source }
            | QueryOp::Reverse { source }
            | QueryOp::First { source, .. }
            | QueryOp::Single { source, .. }
            | QueryOp::Any { source, .. }
            | QueryOp::All { source, .. }
            | QueryOp::Contains { source, .. } => source,
            QueryOp::Join { outer, .. } | QueryOp::GroupJoin { outer, .. } => outer,
        }
    }

    /// Check if the operator reduces a sequence to a single value.
    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            QueryOp::Aggregate { .. }
                | QueryOp::First { .. }
                | QueryOp::Single { .. }
                | QueryOp::Any { .. }
                | QueryOp::All { .. }
                | QueryOp::Contains { .. }
        )
    }
}

/// Values for the [`Expr::Variable`] nodes of a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings {
    values: HashMap<String, Value>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a variable, returning the updated set.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Add every binding of `other`, replacing values of the same name.
    pub fn extend(&mut self, other: &Bindings) {
        for (name, value) in other.iter() {
            self.values.insert(name.to_string(), value.clone());
        }
    }
}
