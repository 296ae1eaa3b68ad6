//! Relational IR nodes.

use std::fmt;

use querykit_proto::{DbQueryType, DbTypeSystem, SqlType, Value};

use crate::expr::{AggregateKind, BinaryOp, ScalarFunction, UnaryOp};

/// Alias naming one table, subquery or join side within a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableAlias(u32);

impl TableAlias {
    pub fn id(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TableAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Hands out table aliases. Aliases are monotonic and never reused.
#[derive(Debug, Default)]
pub struct AliasGenerator {
    next: u32,
}

impl AliasGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_alias(&mut self) -> TableAlias {
        let alias = TableAlias(self.next);
        self.next += 1;
        alias
    }
}

/// Reference to a column declared by a table or select.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub alias: TableAlias,
    pub name: String,
    pub db_type: Option<DbQueryType>,
}

/// Sort key.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderClause {
    pub expr: SqlExpr,
    pub descending: bool,
}

impl OrderClause {
    pub fn new(expr: SqlExpr, descending: bool) -> Self {
        Self { expr, descending }
    }
}

/// Value list or subquery on the right of IN.
#[derive(Debug, Clone, PartialEq)]
pub enum InValues {
    List(Vec<SqlExpr>),
    Select(Box<Select>),
}

/// Relational expression.
///
/// SQL-renderable nodes and the client-side construction nodes of projectors
/// share one type so rewrites can move column references between them.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    Column(ColumnRef),
    /// Constant from the query, bound as a parameter when rendered.
    Literal(Value),
    /// A value bound to a named command parameter.
    NamedValue {
        name: String,
        value: Box<SqlExpr>,
        db_type: Option<DbQueryType>,
    },
    /// Runtime value supplied when a compiled query is executed.
    Variable {
        name: String,
        db_type: Option<DbQueryType>,
    },
    Binary {
        op: BinaryOp,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<SqlExpr>,
    },
    Function {
        function: ScalarFunction,
        args: Vec<SqlExpr>,
    },
    Case {
        test: Box<SqlExpr>,
        if_true: Box<SqlExpr>,
        if_false: Box<SqlExpr>,
    },
    IsNull(Box<SqlExpr>),
    Between {
        expr: Box<SqlExpr>,
        lower: Box<SqlExpr>,
        upper: Box<SqlExpr>,
    },
    In {
        expr: Box<SqlExpr>,
        values: InValues,
    },
    Exists(Box<Select>),
    ScalarSubquery(Box<Select>),
    Aggregate {
        kind: AggregateKind,
        arg: Option<Box<SqlExpr>>,
        distinct: bool,
    },
    /// Aggregate over a group, computed either inside the grouping select
    /// (`in_group`) or as a correlated scalar subquery.
    AggregateSubquery {
        group_alias: TableAlias,
        in_group: Box<SqlExpr>,
        subquery: Box<Select>,
    },
    RowNumber {
        order_by: Vec<OrderClause>,
    },
    /// Mapped entity built from member values.
    Entity {
        entity: String,
        fields: Vec<(String, SqlExpr)>,
    },
    /// Anonymous record.
    New {
        fields: Vec<(String, SqlExpr)>,
    },
    /// Value that is null when the outer-joined row is missing (`test` is null).
    OuterJoined {
        test: Box<SqlExpr>,
        expr: Box<SqlExpr>,
    },
    Grouping {
        key: Box<SqlExpr>,
        elements: Box<SqlExpr>,
    },
    Projection(Box<Projection>),
    ClientJoin(Box<ClientJoin>),
    /// Lazily loaded relationship.
    Deferred(Box<Projection>),
}

impl SqlExpr {
    pub fn column(alias: TableAlias, name: impl Into<String>, db_type: Option<DbQueryType>) -> Self {
        SqlExpr::Column(ColumnRef {
            alias,
            name: name.into(),
            db_type,
        })
    }

    pub fn binary(op: BinaryOp, left: SqlExpr, right: SqlExpr) -> Self {
        SqlExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn equal(left: SqlExpr, right: SqlExpr) -> Self {
        SqlExpr::binary(BinaryOp::Equal, left, right)
    }

    /// Combine two optional predicates with AND.
    pub fn and_also(left: Option<SqlExpr>, right: Option<SqlExpr>) -> Option<SqlExpr> {
        match (left, right) {
            (Some(l), Some(r)) => Some(SqlExpr::binary(BinaryOp::And, l, r)),
            (l, None) => l,
            (None, r) => r,
        }
    }

    /// Check if this node only exists on the client side of a projection.
    pub fn is_client_only(&self) -> bool {
        matches!(
            self,
            SqlExpr::Entity { .. }
                | SqlExpr::New { .. }
                | SqlExpr::OuterJoined { .. }
                | SqlExpr::Grouping { .. }
                | SqlExpr::Projection(_)
                | SqlExpr::ClientJoin(_)
                | SqlExpr::Deferred(_)
        )
    }

    /// Check if the expression yields a boolean in SQL.
    pub fn is_predicate(&self) -> bool {
        match self {
            SqlExpr::Binary { op, .. } => op.is_comparison() || op.is_logical(),
            SqlExpr::Unary {
                op: UnaryOp::Not, ..
            } => true,
            SqlExpr::Function { function, .. } => matches!(
                function,
                ScalarFunction::StartsWith | ScalarFunction::EndsWith | ScalarFunction::Contains
            ),
            SqlExpr::IsNull(_) | SqlExpr::Between { .. } | SqlExpr::In { .. } | SqlExpr::Exists(_) => {
                true
            }
            _ => false,
        }
    }

    /// Best-effort SQL type of the expression.
    pub fn db_type(&self) -> Option<DbQueryType> {
        let types = DbTypeSystem;
        match self {
            SqlExpr::Column(c) => c.db_type,
            SqlExpr::Literal(v) => match v {
                Value::Null => None,
                v => Some(types.column_type(v.kind())),
            },
            SqlExpr::NamedValue { db_type, .. } | SqlExpr::Variable { db_type, .. } => *db_type,
            e if e.is_predicate() => Some(DbQueryType::new(SqlType::Bit)),
            SqlExpr::Binary { left, right, .. } => left.db_type().or_else(|| right.db_type()),
            SqlExpr::Unary { operand, .. } => operand.db_type(),
            SqlExpr::Function { function, args } => match function {
                ScalarFunction::Length => Some(DbQueryType::new(SqlType::Int)),
                ScalarFunction::Concat => Some(DbQueryType::new(SqlType::NVarChar)),
                _ => args.first().and_then(SqlExpr::db_type),
            },
            SqlExpr::Case { if_true, if_false, .. } => {
                if_true.db_type().or_else(|| if_false.db_type())
            }
            SqlExpr::Aggregate { kind, arg, .. } => match kind {
                AggregateKind::Count => Some(DbQueryType::new(SqlType::Int).not_null()),
                AggregateKind::LongCount => Some(DbQueryType::new(SqlType::BigInt).not_null()),
                AggregateKind::Average => Some(DbQueryType::new(SqlType::Float)),
                _ => arg.as_ref().and_then(|a| a.db_type()).map(|mut t| {
                    t.not_null = false;
                    t
                }),
            },
            SqlExpr::AggregateSubquery { in_group, .. } => in_group.db_type(),
            SqlExpr::ScalarSubquery(select) => select.columns.first().and_then(|c| c.db_type),
            SqlExpr::RowNumber { .. } => Some(DbQueryType::new(SqlType::Int).not_null()),
            SqlExpr::OuterJoined { expr, .. } => expr.db_type(),
            _ => None,
        }
    }
}

/// A named output column of a select.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDecl {
    pub name: String,
    pub expr: SqlExpr,
    pub db_type: Option<DbQueryType>,
}

impl ColumnDecl {
    pub fn new(name: impl Into<String>, expr: SqlExpr) -> Self {
        let db_type = expr.db_type();
        Self {
            name: name.into(),
            expr,
            db_type,
        }
    }
}

/// A mapped table reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub alias: TableAlias,
    pub entity: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinKind {
    Cross,
    Inner,
    Outer,
    /// Left outer join matching at most one row on the right.
    SingletonOuter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub left: Source,
    pub right: Source,
    pub condition: Option<SqlExpr>,
}

/// Row source of a select.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Table(Table),
    Select(Box<Select>),
    Join(Box<Join>),
}

impl Source {
    /// Alias of a table or subquery source. Joins have none.
    pub fn alias(&self) -> Option<TableAlias> {
        match self {
            Source::Table(t) => Some(t.alias),
            Source::Select(s) => Some(s.alias),
            Source::Join(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub alias: TableAlias,
    pub columns: Vec<ColumnDecl>,
    pub from: Option<Source>,
    pub where_clause: Option<SqlExpr>,
    pub order_by: Vec<OrderClause>,
    pub group_by: Vec<SqlExpr>,
    pub distinct: bool,
    pub skip: Option<SqlExpr>,
    pub take: Option<SqlExpr>,
    /// Ordering must be reversed when it is lifted out of this select.
    pub reverse: bool,
}

impl Select {
    pub fn new(alias: TableAlias, columns: Vec<ColumnDecl>, from: Option<Source>) -> Self {
        Self {
            alias,
            columns,
            from,
            where_clause: None,
            order_by: Vec::new(),
            group_by: Vec::new(),
            distinct: false,
            skip: None,
            take: None,
            reverse: false,
        }
    }

    pub fn with_where(mut self, predicate: Option<SqlExpr>) -> Self {
        self.where_clause = predicate;
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDecl> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Pick a column name not yet declared by this select.
    pub fn unique_column_name(&self, base: &str) -> String {
        unique_name(base, |n| self.column(n).is_some())
    }

    /// Wrap this select in a new one with the same alias and columns.
    ///
    /// The original moves under `new_alias`; references to the old alias
    /// keep resolving against the wrapper.
    pub fn add_redundant_select(self, new_alias: TableAlias) -> Select {
        let alias = self.alias;
        let columns = self
            .columns
            .iter()
            .map(|c| ColumnDecl {
                name: c.name.clone(),
                expr: SqlExpr::column(new_alias, c.name.clone(), c.db_type),
                db_type: c.db_type,
            })
            .collect();
        let mut inner = self;
        inner.alias = new_alias;
        Select::new(alias, columns, Some(Source::Select(Box::new(inner))))
    }

    /// Check if the select only renames the columns of its source.
    pub fn is_column_projection(&self) -> bool {
        self.columns
            .iter()
            .all(|c| matches!(c.expr, SqlExpr::Column(_) | SqlExpr::Literal(_)))
    }
}

/// Pick `base`, or `base` followed by the smallest free number.
pub fn unique_name(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    let mut i = 1;
    loop {
        let candidate = format!("{}{}", base, i);
        if !taken(&candidate) {
            return candidate;
        }
        i += 1;
    }
}

/// How a projection's rows collapse into a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aggregator {
    /// The single value of a one-row result (COUNT, EXISTS...).
    Scalar,
    First,
    FirstOrDefault,
    Single,
    SingleOrDefault,
}

/// A select paired with the client-side construction of each row.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub select: Select,
    pub projector: SqlExpr,
    pub aggregator: Option<Aggregator>,
}

impl Projection {
    pub fn new(select: Select, projector: SqlExpr) -> Self {
        Self {
            select,
            projector,
            aggregator: None,
        }
    }

    pub fn with_aggregator(mut self, aggregator: Option<Aggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Check if the projection yields at most one object.
    pub fn is_singleton(&self) -> bool {
        matches!(
            self.aggregator,
            Some(
                Aggregator::First
                    | Aggregator::FirstOrDefault
                    | Aggregator::Single
                    | Aggregator::SingleOrDefault
            )
        )
    }
}

/// A nested collection loaded by one batched query per parent result set.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientJoin {
    pub projection: Projection,
    /// Key expressions evaluated on each parent row.
    pub outer_key: Vec<SqlExpr>,
    /// Matching key expressions over the nested query's rows.
    pub inner_key: Vec<SqlExpr>,
}

/// An INSERT, UPDATE or DELETE against one mapped table.
///
/// Column references to the table's alias render unqualified.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteCommand {
    Insert {
        table: Table,
        values: Vec<(String, SqlExpr)>,
    },
    Update {
        table: Table,
        assignments: Vec<(String, SqlExpr)>,
        where_clause: Option<SqlExpr>,
    },
    Delete {
        table: Table,
        where_clause: Option<SqlExpr>,
    },
}

impl WriteCommand {
    pub fn table(&self) -> &Table {
        match self {
            WriteCommand::Insert { table, .. }
            | WriteCommand::Update { table, .. }
            | WriteCommand::Delete { table, .. } => table,
        }
    }
}
