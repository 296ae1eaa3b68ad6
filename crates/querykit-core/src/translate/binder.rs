//! Binding logical queries into relational projections.

use std::collections::HashSet;

use querykit_proto::Value;
use tracing::trace;

use crate::error::{Error, Result};
use crate::expr::{AggregateKind, BinaryOp, Expr, Lambda, QueryOp, ScalarFunction, UnaryOp};
use crate::ir::gather;
use crate::ir::{
    Aggregator, AliasGenerator, ColumnDecl, ColumnProjector, InValues, Join, JoinKind,
    OrderClause, Projection, Select, Source, SqlExpr, Table, TableAlias,
};
use crate::language::AggregateChecker;
use crate::mapping::{QueryMapping, Relationship};
use crate::police::EntityPolicy;

/// Joins synthesized from singleton navigation while binding one operator's
/// lambdas.
#[derive(Default)]
struct Scope {
    aliases: HashSet<TableAlias>,
    joins: Vec<(Select, SqlExpr)>,
    navigations: Vec<(Vec<SqlExpr>, String, SqlExpr)>,
}

/// The grouping select an element sub-projection belongs to.
#[derive(Debug, Clone)]
struct GroupInfo {
    alias: TableAlias,
    /// Element expression over the grouping select's source.
    element: SqlExpr,
}

/// Maps logical operators onto selects and projectors.
///
/// Every table reference gets fresh aliases, so binding the same logical
/// sub-tree twice yields two independent relational sub-trees.
pub struct QueryBinder<'a> {
    mapping: &'a dyn QueryMapping,
    policy: &'a EntityPolicy,
    aliases: &'a mut AliasGenerator,
    parameters: Vec<(String, SqlExpr)>,
    scopes: Vec<Scope>,
    groups: Vec<(Projection, GroupInfo)>,
    current_group: Option<Projection>,
    applying: Vec<String>,
}

impl<'a> QueryBinder<'a> {
    pub fn new(
        mapping: &'a dyn QueryMapping,
        policy: &'a EntityPolicy,
        aliases: &'a mut AliasGenerator,
    ) -> Self {
        Self {
            mapping,
            policy,
            aliases,
            parameters: Vec::new(),
            scopes: Vec::new(),
            groups: Vec::new(),
            current_group: None,
            applying: Vec::new(),
        }
    }

    /// Bind a whole query. Scalar operators at the root produce a projection
    /// with an [`Aggregator`].
    pub fn bind(&mut self, expr: &Expr) -> Result<Projection> {
        let bound = match expr {
            Expr::Query(op) => self.visit_op(op, true)?,
            other => self.visit(other)?,
        };
        match bound {
            SqlExpr::Projection(p) => Ok(*p),
            other => Err(Error::unsupported(format!(
                "query root does not produce a sequence: {:?}",
                other
            ))),
        }
    }

    /// Correlated projection of the rows `owner.member` refers to, with the
    /// policy's associated operations applied.
    pub fn relationship(&mut self, owner: &SqlExpr, relationship: &Relationship) -> Result<Projection> {
        let owner_entity = entity_name(owner)
            .ok_or_else(|| Error::unsupported(format!("'{}' accessed on a non-entity", relationship.member)))?
            .to_string();
        let keys = owner_keys(owner, relationship)?;
        let related = self.table(&relationship.related_entity)?;
        let condition = key_condition(&related.projector, relationship, &keys)?;
        let projector = related.projector.clone();
        let mut projection = self.wrap(related, projector, Vec::new(), |s| {
            s.where_clause = Some(condition)
        });
        for op in self.policy.associations(&owner_entity, &relationship.member).to_vec() {
            let bound = self.lambda(&op, &[SqlExpr::Projection(Box::new(projection))])?;
            projection = as_sequence(bound)?;
        }
        if relationship.is_singleton() {
            projection.aggregator = Some(Aggregator::SingleOrDefault);
        }
        Ok(projection)
    }

    /// Bind a predicate over one row of `entity` whose columns are referenced
    /// through `table_alias`, for the WHERE clause of a write command.
    pub fn predicate(&mut self, entity: &str, table_alias: TableAlias, predicate: &Lambda) -> Result<SqlExpr> {
        let mapping = self.mapping.require_entity(entity)?;
        let row = SqlExpr::Entity {
            entity: entity.to_string(),
            fields: mapping
                .columns
                .iter()
                .map(|c| {
                    (
                        c.member.clone(),
                        SqlExpr::column(table_alias, c.column.clone(), Some(c.db_type)),
                    )
                })
                .collect(),
        };
        let (bound, joins) = self.scoped(&[table_alias], |this| this.lambda(predicate, &[row]))?;
        if !joins.is_empty() {
            return Err(Error::unsupported(format!(
                "write predicate on '{}' navigates a relationship",
                entity
            )));
        }
        Ok(scalar(bound))
    }

    fn visit(&mut self, expr: &Expr) -> Result<SqlExpr> {
        match expr {
            Expr::Constant(v) => Ok(SqlExpr::Literal(v.clone())),
            Expr::Variable(name) => Ok(SqlExpr::Variable {
                name: name.clone(),
                db_type: None,
            }),
            Expr::Parameter(name) => self
                .parameters
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .map(|(_, e)| e.clone())
                .ok_or_else(|| Error::unsupported(format!("unbound lambda parameter '{}'", name))),
            Expr::Table(entity) => Ok(SqlExpr::Projection(Box::new(self.table(entity)?))),
            Expr::Query(op) => self.visit_op(op, false),
            Expr::Member(inner, member) => {
                let source = self.visit(inner)?;
                self.member(source, member)
            }
            Expr::Binary(op, left, right) => {
                let left = self.visit(left)?;
                let right = self.visit(right)?;
                self.binary(*op, left, right)
            }
            Expr::Unary(op, operand) => {
                let operand = scalar(self.visit(operand)?);
                Ok(match (op, operand) {
                    (UnaryOp::Not, SqlExpr::Literal(Value::Bool(b))) => SqlExpr::Literal(Value::Bool(!b)),
                    (op, operand) => SqlExpr::Unary {
                        op: *op,
                        operand: Box::new(operand),
                    },
                })
            }
            Expr::Conditional(test, if_true, if_false) => Ok(SqlExpr::Case {
                test: Box::new(scalar(self.visit(test)?)),
                if_true: Box::new(scalar(self.visit(if_true)?)),
                if_false: Box::new(scalar(self.visit(if_false)?)),
            }),
            Expr::Call(function, args) => {
                let args = args
                    .iter()
                    .map(|a| Ok(scalar(self.visit(a)?)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(SqlExpr::Function {
                    function: *function,
                    args,
                })
            }
            Expr::New(fields) => {
                let fields = fields
                    .iter()
                    .map(|(name, e)| Ok((name.clone(), self.visit(e)?)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(SqlExpr::New { fields })
            }
        }
    }

    fn visit_op(&mut self, op: &QueryOp, is_root: bool) -> Result<SqlExpr> {
        let projection = match op {
            QueryOp::Where { source, predicate } => self.bind_where(source, predicate)?,
            QueryOp::Select { source, selector } => self.bind_select(source, selector)?,
            QueryOp::SelectMany {
                source,
                collection,
                result,
            } => self.bind_select_many(source, collection, result.as_ref())?,
            QueryOp::Join {
                outer,
                inner,
                outer_key,
                inner_key,
                result,
            } => self.bind_join(outer, inner, outer_key, inner_key, result)?,
            QueryOp::GroupJoin {
                outer,
                inner,
                outer_key,
                inner_key,
                result,
            } => self.bind_group_join(outer, inner, outer_key, inner_key, result)?,
            QueryOp::OrderBy { .. } | QueryOp::ThenBy { .. } => self.bind_order_by(op)?,
            QueryOp::GroupBy {
                source,
                key,
                element,
                result,
            } => self.bind_group_by(source, key, element.as_ref(), result.as_ref())?,
            QueryOp::Take { source, count } => {
                let count = self.visit(count)?;
                self.modify(source, |s| s.take = Some(count))?
            }
            QueryOp::Skip { source, count } => {
                let count = self.visit(count)?;
                self.modify(source, |s| s.skip = Some(count))?
            }
            QueryOp::Distinct { source } => self.modify(source, |s| s.distinct = true)?,
            QueryOp::Reverse { source } => self.modify(source, |s| s.reverse = true)?,
            QueryOp::Aggregate {
                source,
                kind,
                selector,
            } => return self.bind_aggregate(source, *kind, selector.as_ref(), is_root),
            QueryOp::First {
                source,
                predicate,
                or_default,
            } => {
                let aggregator = if *or_default {
                    Aggregator::FirstOrDefault
                } else {
                    Aggregator::First
                };
                self.bind_first(source, predicate.as_ref(), aggregator, true)?
            }
            QueryOp::Single {
                source,
                predicate,
                or_default,
            } => {
                let aggregator = if *or_default {
                    Aggregator::SingleOrDefault
                } else {
                    Aggregator::Single
                };
                self.bind_first(source, predicate.as_ref(), aggregator, false)?
            }
            QueryOp::Any { source, predicate } => {
                return self.bind_any_all(source, predicate.as_ref(), false, is_root)
            }
            QueryOp::All { source, predicate } => {
                return self.bind_any_all(source, Some(predicate), true, is_root)
            }
            QueryOp::Contains { source, item } => return self.bind_contains(source, item, is_root),
        };
        Ok(SqlExpr::Projection(Box::new(projection)))
    }

    fn sequence(&mut self, expr: &Expr) -> Result<Projection> {
        let bound = self.visit(expr)?;
        as_sequence(bound)
    }

    fn lambda(&mut self, lambda: &Lambda, args: &[SqlExpr]) -> Result<SqlExpr> {
        if lambda.parameters.len() != args.len() {
            return Err(Error::unsupported(format!(
                "lambda takes {} parameters, {} supplied",
                lambda.parameters.len(),
                args.len()
            )));
        }
        let depth = self.parameters.len();
        for (name, arg) in lambda.parameters.iter().zip(args) {
            self.parameters.push((name.clone(), arg.clone()));
        }
        let result = self.visit(&lambda.body);
        self.parameters.truncate(depth);
        result
    }

    /// Run `f` with a navigation scope over `aliases`, returning the joins it
    /// synthesized.
    fn scoped<T>(
        &mut self,
        aliases: &[TableAlias],
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<(T, Vec<(Select, SqlExpr)>)> {
        self.scopes.push(Scope {
            aliases: aliases.iter().copied().collect(),
            ..Scope::default()
        });
        let result = f(self);
        let joins = self.scopes.pop().map(|s| s.joins).unwrap_or_default();
        Ok((result?, joins))
    }

    /// A new select over `projection` exposing `projector`.
    fn wrap(
        &mut self,
        projection: Projection,
        projector: SqlExpr,
        joins: Vec<(Select, SqlExpr)>,
        modify: impl FnOnce(&mut Select),
    ) -> Projection {
        let alias = self.aliases.next_alias();
        let mut existing = HashSet::from([projection.select.alias]);
        existing.extend(joins.iter().map(|(s, _)| s.alias));
        let pc = ColumnProjector::project(projector, Vec::new(), alias, &existing);
        let from = with_joins(Source::Select(Box::new(projection.select)), joins);
        let mut select = Select::new(alias, pc.columns, Some(from));
        modify(&mut select);
        Projection::new(select, pc.projector)
    }

    fn modify(&mut self, source: &Expr, modify: impl FnOnce(&mut Select)) -> Result<Projection> {
        let projection = self.sequence(source)?;
        let projector = projection.projector.clone();
        Ok(self.wrap(projection, projector, Vec::new(), modify))
    }

    fn table(&mut self, entity: &str) -> Result<Projection> {
        let mapping = self.mapping.require_entity(entity)?;
        let table_alias = self.aliases.next_alias();
        let alias = self.aliases.next_alias();
        let mut columns = Vec::with_capacity(mapping.columns.len());
        let mut fields = Vec::with_capacity(mapping.columns.len());
        for column in &mapping.columns {
            let ty = Some(column.db_type);
            columns.push(ColumnDecl::new(
                column.column.clone(),
                SqlExpr::column(table_alias, column.column.clone(), ty),
            ));
            fields.push((column.member.clone(), SqlExpr::column(alias, column.column.clone(), ty)));
        }
        let table = Table {
            alias: table_alias,
            entity: entity.to_string(),
            name: mapping.table.clone(),
        };
        let select = Select::new(alias, columns, Some(Source::Table(table)));
        let mut projection = Projection::new(
            select,
            SqlExpr::Entity {
                entity: entity.to_string(),
                fields,
            },
        );

        if !self.applying.iter().any(|e| e == entity) {
            let operations = self.policy.operations(entity).to_vec();
            self.applying.push(entity.to_string());
            for op in &operations {
                trace!(entity, "applying policy operation");
                let bound = self.lambda(op, &[SqlExpr::Projection(Box::new(projection))]);
                projection = match bound.and_then(as_sequence) {
                    Ok(p) => p,
                    Err(e) => {
                        self.applying.pop();
                        return Err(e);
                    }
                };
            }
            self.applying.pop();
        }
        Ok(projection)
    }

    fn member(&mut self, source: SqlExpr, member: &str) -> Result<SqlExpr> {
        match source {
            SqlExpr::Entity { entity, fields } => {
                if let Some((_, e)) = fields.iter().find(|(n, _)| n == member) {
                    return Ok(e.clone());
                }
                let relationship = self
                    .mapping
                    .require_entity(&entity)?
                    .relationship(member)
                    .cloned()
                    .ok_or_else(|| Error::unmapped_member(&entity, member))?;
                let owner = SqlExpr::Entity { entity, fields };
                if relationship.is_singleton() {
                    if let Some(joined) = self.navigate(&owner, &relationship)? {
                        return Ok(joined);
                    }
                }
                Ok(SqlExpr::Projection(Box::new(self.relationship(&owner, &relationship)?)))
            }
            SqlExpr::OuterJoined { expr, .. } => self.member(*expr, member),
            SqlExpr::New { fields } => fields
                .into_iter()
                .find(|(n, _)| n == member)
                .map(|(_, e)| e)
                .ok_or_else(|| Error::unsupported(format!("record has no member '{}'", member))),
            SqlExpr::Grouping { key, .. } if member == "Key" => Ok(*key),
            SqlExpr::Projection(p) if p.is_singleton() => {
                let p = *p;
                let projector = self.member(p.projector, member)?;
                Ok(SqlExpr::Projection(Box::new(Projection {
                    select: p.select,
                    projector,
                    aggregator: p.aggregator,
                })))
            }
            other => Err(Error::unsupported(format!(
                "member '{}' accessed on a non-record value {:?}",
                member, other
            ))),
        }
    }

    /// Join the related entity of a singleton relationship onto the scope
    /// that owns `owner`'s columns.
    fn navigate(&mut self, owner: &SqlExpr, relationship: &Relationship) -> Result<Option<SqlExpr>> {
        let keys = owner_keys(owner, relationship)?;
        let refs: HashSet<TableAlias> = keys.iter().flat_map(gather::referenced_aliases).collect();
        let Some(index) = self
            .scopes
            .iter()
            .rposition(|s| refs.iter().all(|a| s.aliases.contains(a)))
        else {
            return Ok(None);
        };
        if let Some((_, _, joined)) = self.scopes[index]
            .navigations
            .iter()
            .find(|(k, m, _)| *k == keys && *m == relationship.member)
        {
            return Ok(Some(joined.clone()));
        }

        let related = self.table(&relationship.related_entity)?;
        let condition = key_condition(&related.projector, relationship, &keys)?;
        let test = relationship
            .keys
            .first()
            .map(|(_, related_member)| entity_field(&related.projector, related_member))
            .transpose()?
            .ok_or_else(|| Error::AmbiguousRelationship(relationship.member.clone()))?;
        let joined = SqlExpr::OuterJoined {
            test: Box::new(test),
            expr: Box::new(related.projector),
        };

        let scope = &mut self.scopes[index];
        scope.aliases.insert(related.select.alias);
        scope.joins.push((related.select, condition));
        scope
            .navigations
            .push((keys, relationship.member.clone(), joined.clone()));
        Ok(Some(joined))
    }

    fn binary(&mut self, op: BinaryOp, left: SqlExpr, right: SqlExpr) -> Result<SqlExpr> {
        let left = scalar(left);
        let right = scalar(right);
        match op {
            BinaryOp::Equal => compare(left, right),
            BinaryOp::NotEqual => Ok(match compare(left, right)? {
                SqlExpr::Binary {
                    op: BinaryOp::Equal,
                    left,
                    right,
                } => SqlExpr::Binary {
                    op: BinaryOp::NotEqual,
                    left,
                    right,
                },
                other => SqlExpr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(other),
                },
            }),
            BinaryOp::Add if is_string(&left) || is_string(&right) => Ok(SqlExpr::Function {
                function: ScalarFunction::Concat,
                args: vec![left, right],
            }),
            op => Ok(SqlExpr::binary(op, left, right)),
        }
    }

    fn bind_where(&mut self, source: &Expr, predicate: &Lambda) -> Result<Projection> {
        let projection = self.sequence(source)?;
        let row = projection.projector.clone();
        let (predicate, joins) = self.scoped(&[projection.select.alias], |this| {
            this.lambda(predicate, &[row.clone()])
        })?;
        let predicate = match scalar(predicate) {
            SqlExpr::Literal(Value::Bool(true)) => None,
            other => Some(other),
        };
        Ok(self.wrap(projection, row, joins, |s| s.where_clause = predicate))
    }

    fn bind_select(&mut self, source: &Expr, selector: &Lambda) -> Result<Projection> {
        let projection = self.sequence(source)?;
        let row = projection.projector.clone();
        let (projector, joins) =
            self.scoped(&[projection.select.alias], |this| this.lambda(selector, &[row]))?;
        Ok(self.wrap(projection, projector, joins, |_| {}))
    }

    fn bind_select_many(
        &mut self,
        source: &Expr,
        collection: &Lambda,
        result: Option<&Lambda>,
    ) -> Result<Projection> {
        let projection = self.sequence(source)?;
        let row = projection.projector.clone();
        let (bound, joins) = self.scoped(&[projection.select.alias], |this| {
            this.lambda(collection, &[row.clone()])
        })?;
        let inner = as_sequence(bound)?;

        let mut left_aliases = HashSet::from([projection.select.alias]);
        left_aliases.extend(joins.iter().map(|(s, _)| s.alias));
        let (kind, condition, right) = decorrelate(inner.select, &left_aliases)?;

        let mut scope_aliases: Vec<TableAlias> = left_aliases.iter().copied().collect();
        scope_aliases.push(right.alias);
        let (projector, result_joins) = match result {
            Some(r) => {
                let args = [row, inner.projector];
                self.scoped(&scope_aliases, |this| this.lambda(r, &args))?
            }
            None => (inner.projector, Vec::new()),
        };

        let alias = self.aliases.next_alias();
        let mut existing: HashSet<TableAlias> = scope_aliases.into_iter().collect();
        existing.extend(result_joins.iter().map(|(s, _)| s.alias));
        let join = Source::Join(Box::new(Join {
            kind,
            left: with_joins(Source::Select(Box::new(projection.select)), joins),
            right: Source::Select(Box::new(right)),
            condition,
        }));
        let pc = ColumnProjector::project(projector, Vec::new(), alias, &existing);
        let select = Select::new(alias, pc.columns, Some(with_joins(join, result_joins)));
        Ok(Projection::new(select, pc.projector))
    }

    fn bind_join(
        &mut self,
        outer: &Expr,
        inner: &Expr,
        outer_key: &Lambda,
        inner_key: &Lambda,
        result: &Lambda,
    ) -> Result<Projection> {
        let outer = self.sequence(outer)?;
        let inner = self.sequence(inner)?;
        let (outer_row, inner_row) = (outer.projector.clone(), inner.projector.clone());
        let (outer_key, outer_joins) = self.scoped(&[outer.select.alias], |this| {
            this.lambda(outer_key, &[outer_row.clone()])
        })?;
        let (inner_key, inner_joins) = self.scoped(&[inner.select.alias], |this| {
            this.lambda(inner_key, &[inner_row.clone()])
        })?;

        let mut existing = HashSet::from([outer.select.alias, inner.select.alias]);
        existing.extend(outer_joins.iter().chain(&inner_joins).map(|(s, _)| s.alias));
        let scope_aliases: Vec<TableAlias> = existing.iter().copied().collect();
        let (projector, result_joins) = self.scoped(&scope_aliases, |this| {
            this.lambda(result, &[outer_row, inner_row])
        })?;
        existing.extend(result_joins.iter().map(|(s, _)| s.alias));

        let condition = compare(scalar(outer_key), scalar(inner_key))?;
        let join = Source::Join(Box::new(Join {
            kind: JoinKind::Inner,
            left: with_joins(Source::Select(Box::new(outer.select)), outer_joins),
            right: with_joins(Source::Select(Box::new(inner.select)), inner_joins),
            condition: Some(condition),
        }));
        let alias = self.aliases.next_alias();
        let pc = ColumnProjector::project(projector, Vec::new(), alias, &existing);
        let select = Select::new(alias, pc.columns, Some(with_joins(join, result_joins)));
        Ok(Projection::new(select, pc.projector))
    }

    fn bind_group_join(
        &mut self,
        outer: &Expr,
        inner: &Expr,
        outer_key: &Lambda,
        inner_key: &Lambda,
        result: &Lambda,
    ) -> Result<Projection> {
        let outer = self.sequence(outer)?;
        let outer_row = outer.projector.clone();
        let (outer_key, outer_joins) = self.scoped(&[outer.select.alias], |this| {
            this.lambda(outer_key, &[outer_row.clone()])
        })?;

        let inner = self.sequence(inner)?;
        let inner_row = inner.projector.clone();
        let (inner_key, inner_joins) = self.scoped(&[inner.select.alias], |this| {
            this.lambda(inner_key, &[inner_row.clone()])
        })?;
        let predicate = compare(scalar(inner_key), scalar(outer_key))?;
        let group = self.wrap(inner, inner_row, inner_joins, |s| {
            s.where_clause = Some(predicate)
        });

        let mut existing = HashSet::from([outer.select.alias]);
        existing.extend(outer_joins.iter().map(|(s, _)| s.alias));
        let scope_aliases: Vec<TableAlias> = existing.iter().copied().collect();
        let (projector, result_joins) = self.scoped(&scope_aliases, |this| {
            this.lambda(result, &[outer_row, SqlExpr::Projection(Box::new(group))])
        })?;
        existing.extend(result_joins.iter().map(|(s, _)| s.alias));

        let alias = self.aliases.next_alias();
        let pc = ColumnProjector::project(projector, Vec::new(), alias, &existing);
        let from = with_joins(
            with_joins(Source::Select(Box::new(outer.select)), outer_joins),
            result_joins,
        );
        Ok(Projection::new(Select::new(alias, pc.columns, Some(from)), pc.projector))
    }

    fn bind_order_by(&mut self, op: &QueryOp) -> Result<Projection> {
        let mut keys = Vec::new();
        let mut current = op;
        let source = loop {
            match current {
                QueryOp::OrderBy {
                    source,
                    key,
                    descending,
                } => {
                    keys.push((key, *descending));
                    break source;
                }
                QueryOp::ThenBy {
                    source,
                    key,
                    descending,
                } => {
                    keys.push((key, *descending));
                    current = match source {
                        Expr::Query(inner) => &**inner,
                        _ => return Err(Error::unsupported("ThenBy must follow OrderBy")),
                    };
                }
                _ => return Err(Error::unsupported("ThenBy must follow OrderBy")),
            }
        };
        keys.reverse();

        let projection = self.sequence(source)?;
        let row = projection.projector.clone();
        let (orderings, joins) = self.scoped(&[projection.select.alias], |this| {
            let mut orderings = Vec::new();
            for (key, descending) in &keys {
                let key = scalar(this.lambda(key, &[row.clone()])?);
                expand_ordering(key, *descending, &mut orderings);
            }
            Ok(orderings)
        })?;
        let projector = projection.projector.clone();
        Ok(self.wrap(projection, projector, joins, |s| s.order_by = orderings))
    }

    fn bind_group_by(
        &mut self,
        source: &Expr,
        key: &Lambda,
        element: Option<&Lambda>,
        result: Option<&Lambda>,
    ) -> Result<Projection> {
        let projection = self.sequence(source)?;
        let row = projection.projector.clone();
        let ((key_expr, element_expr), joins) = self.scoped(&[projection.select.alias], |this| {
            let key_expr = this.lambda(key, &[row.clone()])?;
            let element_expr = match element {
                Some(e) => this.lambda(e, &[row.clone()])?,
                None => row.clone(),
            };
            Ok((key_expr, element_expr))
        })?;
        let mut existing = HashSet::from([projection.select.alias]);
        existing.extend(joins.iter().map(|(s, _)| s.alias));
        let group_exprs = server_parts(key_expr.clone(), projection.select.alias, &existing);

        // The elements of each group come from a second binding of the source,
        // correlated to the group key.
        let basis = self.sequence(source)?;
        let basis_row = basis.projector.clone();
        let ((basis_key, basis_element), basis_joins) =
            self.scoped(&[basis.select.alias], |this| {
                let key_expr = this.lambda(key, &[basis_row.clone()])?;
                let element_expr = match element {
                    Some(e) => this.lambda(e, &[basis_row.clone()])?,
                    None => basis_row.clone(),
                };
                Ok((key_expr, element_expr))
            })?;
        let mut basis_existing = HashSet::from([basis.select.alias]);
        basis_existing.extend(basis_joins.iter().map(|(s, _)| s.alias));
        let basis_exprs = server_parts(basis_key, basis.select.alias, &basis_existing);
        let correlation = nulls_equal(basis_exprs, group_exprs.clone());

        let element_alias = self.aliases.next_alias();
        let pc = ColumnProjector::project(basis_element, Vec::new(), element_alias, &basis_existing);
        let element_select = Select::new(
            element_alias,
            pc.columns,
            Some(with_joins(Source::Select(Box::new(basis.select)), basis_joins)),
        )
        .with_where(correlation);
        let element_projection = Projection::new(element_select, pc.projector);

        let alias = self.aliases.next_alias();
        let info = GroupInfo {
            alias,
            element: element_expr,
        };
        self.groups.push((element_projection.clone(), info.clone()));

        let result_expr = match result {
            Some(r) => {
                let saved = self.current_group.replace(element_projection.clone());
                let scope_aliases: Vec<TableAlias> = existing.iter().copied().collect();
                let args = [key_expr, SqlExpr::Projection(Box::new(element_projection))];
                let bound = self.scoped(&scope_aliases, |this| this.lambda(r, &args));
                self.current_group = saved;
                let (expr, result_joins) = bound?;
                if !result_joins.is_empty() {
                    return Err(Error::unsupported(
                        "navigation through a relationship of a group key",
                    ));
                }
                expr
            }
            None => SqlExpr::Grouping {
                key: Box::new(key_expr),
                elements: Box::new(SqlExpr::Projection(Box::new(element_projection))),
            },
        };

        let pc = ColumnProjector::project(result_expr, Vec::new(), alias, &existing);
        if let SqlExpr::Grouping { elements, .. } = &pc.projector {
            if let SqlExpr::Projection(p) = &**elements {
                self.groups.push(((**p).clone(), info));
            }
        }
        let mut select = Select::new(
            alias,
            pc.columns,
            Some(with_joins(Source::Select(Box::new(projection.select)), joins)),
        );
        select.group_by = group_exprs;
        Ok(Projection::new(select, pc.projector))
    }

    fn bind_aggregate(
        &mut self,
        source: &Expr,
        kind: AggregateKind,
        selector: Option<&Lambda>,
        is_root: bool,
    ) -> Result<SqlExpr> {
        let projection = self.sequence(source)?;
        let group = self
            .groups
            .iter()
            .rev()
            .find(|(p, _)| *p == projection)
            .map(|(_, info)| info.clone());
        let is_current_group = self.current_group.as_ref() == Some(&projection);

        let row = projection.projector.clone();
        let (arg, joins) = match selector {
            Some(s) if kind.has_argument() => {
                let (arg, joins) =
                    self.scoped(&[projection.select.alias], |this| this.lambda(s, &[row.clone()]))?;
                (Some(scalar(arg)), joins)
            }
            _ if kind.has_argument() => (Some(row.clone()), Vec::new()),
            _ => (None, Vec::new()),
        };
        let aggregate = SqlExpr::Aggregate {
            kind,
            arg: arg.map(Box::new),
            distinct: false,
        };

        let alias = self.aliases.next_alias();
        let from = with_joins(Source::Select(Box::new(projection.select)), joins);
        let select = Select::new(alias, vec![ColumnDecl::new("value", aggregate)], Some(from));
        if is_root {
            let value = SqlExpr::column(alias, "value", select.columns[0].db_type);
            return Ok(SqlExpr::Projection(Box::new(
                Projection::new(select, value).with_aggregator(Some(Aggregator::Scalar)),
            )));
        }

        if let Some(info) = group {
            let in_group_arg = match selector {
                Some(s) if kind.has_argument() => {
                    let (arg, joins) = self.scoped(&[], |this| this.lambda(s, &[info.element.clone()]))?;
                    if !joins.is_empty() {
                        return Ok(SqlExpr::ScalarSubquery(Box::new(select)));
                    }
                    Some(scalar(arg))
                }
                _ if kind.has_argument() => Some(info.element.clone()),
                _ => None,
            };
            let in_group = SqlExpr::Aggregate {
                kind,
                arg: in_group_arg.map(Box::new),
                distinct: false,
            };
            if is_current_group {
                return Ok(in_group);
            }
            return Ok(SqlExpr::AggregateSubquery {
                group_alias: info.alias,
                in_group: Box::new(in_group),
                subquery: Box::new(select),
            });
        }
        Ok(SqlExpr::ScalarSubquery(Box::new(select)))
    }

    fn bind_first(
        &mut self,
        source: &Expr,
        predicate: Option<&Lambda>,
        aggregator: Aggregator,
        take_one: bool,
    ) -> Result<Projection> {
        let mut projection = self.sequence(source)?;
        if predicate.is_some() || take_one {
            let row = projection.projector.clone();
            let (predicate, joins) = match predicate {
                Some(p) => {
                    let (e, joins) = self.scoped(&[projection.select.alias], |this| {
                        this.lambda(p, &[row.clone()])
                    })?;
                    (Some(scalar(e)), joins)
                }
                None => (None, Vec::new()),
            };
            projection = self.wrap(projection, row, joins, |s| {
                s.where_clause = predicate;
                if take_one {
                    s.take = Some(SqlExpr::Literal(Value::Int32(1)));
                }
            });
        }
        Ok(projection.with_aggregator(Some(aggregator)))
    }

    fn bind_any_all(
        &mut self,
        source: &Expr,
        predicate: Option<&Lambda>,
        is_all: bool,
        is_root: bool,
    ) -> Result<SqlExpr> {
        let projection = self.sequence(source)?;
        let row = projection.projector.clone();
        let (predicate, joins) = match predicate {
            Some(p) => {
                let (e, joins) =
                    self.scoped(&[projection.select.alias], |this| this.lambda(p, &[row]))?;
                (Some(scalar(e)), joins)
            }
            None => (None, Vec::new()),
        };
        let predicate = if is_all {
            predicate.map(|p| SqlExpr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(p),
            })
        } else {
            predicate
        };
        let alias = self.aliases.next_alias();
        let from = with_joins(Source::Select(Box::new(projection.select)), joins);

        if is_root {
            let count = SqlExpr::Aggregate {
                kind: AggregateKind::Count,
                arg: None,
                distinct: false,
            };
            let select = Select::new(alias, vec![ColumnDecl::new("value", count)], Some(from))
                .with_where(predicate);
            let value = SqlExpr::column(alias, "value", select.columns[0].db_type);
            let zero = SqlExpr::Literal(Value::Int32(0));
            let test = if is_all {
                SqlExpr::equal(value, zero)
            } else {
                SqlExpr::binary(BinaryOp::GreaterThan, value, zero)
            };
            return Ok(SqlExpr::Projection(Box::new(
                Projection::new(select, test).with_aggregator(Some(Aggregator::Scalar)),
            )));
        }

        let exists = SqlExpr::Exists(Box::new(
            Select::new(alias, Vec::new(), Some(from)).with_where(predicate),
        ));
        Ok(if is_all {
            SqlExpr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(exists),
            }
        } else {
            exists
        })
    }

    fn bind_contains(&mut self, source: &Expr, item: &Expr, is_root: bool) -> Result<SqlExpr> {
        if !is_root {
            let projection = self.sequence(source)?;
            let column = match &projection.projector {
                SqlExpr::Column(c) if c.alias == projection.select.alias => Some(c.name.clone()),
                _ => None,
            };
            if let Some(name) = column {
                let item = scalar(self.visit(item)?);
                if !item.is_client_only() {
                    let mut select = projection.select;
                    select.columns.retain(|c| c.name == name);
                    return Ok(SqlExpr::In {
                        expr: Box::new(item),
                        values: InValues::Select(Box::new(select)),
                    });
                }
            }
        }
        let parameter = format!("__item{}", self.parameters.len());
        let predicate = Lambda::new(
            parameter.clone(),
            Expr::Binary(
                BinaryOp::Equal,
                Box::new(Expr::Parameter(parameter)),
                Box::new(item.clone()),
            ),
        );
        self.bind_any_all(source, Some(&predicate), false, is_root)
    }
}

fn as_sequence(expr: SqlExpr) -> Result<Projection> {
    match expr {
        SqlExpr::Projection(p) => {
            let mut p = *p;
            p.aggregator = None;
            Ok(p)
        }
        SqlExpr::Grouping { elements, .. } => as_sequence(*elements),
        other => Err(Error::unsupported(format!("expression is not a sequence: {:?}", other))),
    }
}

/// Turn a single-valued projection of one column into a scalar subquery.
fn scalar(expr: SqlExpr) -> SqlExpr {
    match expr {
        SqlExpr::Projection(p) if p.is_singleton() => {
            let column = match &p.projector {
                SqlExpr::Column(c) if c.alias == p.select.alias => Some(c.name.clone()),
                _ => None,
            };
            match column {
                Some(name) => {
                    let mut select = p.select;
                    select.columns.retain(|c| c.name == name);
                    SqlExpr::ScalarSubquery(Box::new(select))
                }
                None => SqlExpr::Projection(p),
            }
        }
        other => other,
    }
}

fn is_string(expr: &SqlExpr) -> bool {
    match expr {
        SqlExpr::Literal(v) => matches!(v, Value::String(_)),
        e => e.db_type().map_or(false, |t| t.sql_type.is_string()),
    }
}

/// Equality over scalars, records and entities. Entities compare by key.
fn compare(left: SqlExpr, right: SqlExpr) -> Result<SqlExpr> {
    match (left, right) {
        (SqlExpr::OuterJoined { test, .. }, SqlExpr::Literal(Value::Null))
        | (SqlExpr::Literal(Value::Null), SqlExpr::OuterJoined { test, .. }) => {
            Ok(SqlExpr::IsNull(test))
        }
        (SqlExpr::OuterJoined { expr, .. }, other) | (other, SqlExpr::OuterJoined { expr, .. }) => {
            compare(*expr, other)
        }
        (e @ SqlExpr::Entity { .. }, SqlExpr::Literal(Value::Null))
        | (SqlExpr::Literal(Value::Null), e @ SqlExpr::Entity { .. }) => {
            let key = first_field(&e)?;
            Ok(SqlExpr::IsNull(Box::new(key)))
        }
        (SqlExpr::Literal(Value::Null), e) | (e, SqlExpr::Literal(Value::Null)) => {
            Ok(SqlExpr::IsNull(Box::new(e)))
        }
        (
            SqlExpr::Entity {
                entity: a,
                fields: left,
            },
            SqlExpr::Entity {
                entity: b,
                fields: right,
            },
        ) => {
            if a != b {
                return Err(Error::unsupported(format!(
                    "cannot compare entities '{}' and '{}'",
                    a, b
                )));
            }
            fields_equal(left, right)
        }
        (SqlExpr::New { fields: left }, SqlExpr::New { fields: right }) => fields_equal(left, right),
        (left, right) => Ok(SqlExpr::equal(left, right)),
    }
}

fn fields_equal(left: Vec<(String, SqlExpr)>, right: Vec<(String, SqlExpr)>) -> Result<SqlExpr> {
    let mut result = None;
    for (name, l) in left {
        let Some((_, r)) = right.iter().find(|(n, _)| *n == name) else {
            return Err(Error::unsupported(format!("records differ in member '{}'", name)));
        };
        result = SqlExpr::and_also(result, Some(compare(l, r.clone())?));
    }
    Ok(result.unwrap_or(SqlExpr::Literal(Value::Bool(true))))
}

fn first_field(entity: &SqlExpr) -> Result<SqlExpr> {
    match entity {
        SqlExpr::Entity { fields, .. } => fields
            .first()
            .map(|(_, e)| e.clone())
            .ok_or_else(|| Error::unsupported("entity without members")),
        _ => Err(Error::unsupported("not an entity")),
    }
}

fn entity_name(expr: &SqlExpr) -> Option<&str> {
    match expr {
        SqlExpr::Entity { entity, .. } => Some(entity.as_str()),
        SqlExpr::OuterJoined { expr, .. } => entity_name(expr),
        _ => None,
    }
}

fn entity_field(expr: &SqlExpr, member: &str) -> Result<SqlExpr> {
    match expr {
        SqlExpr::Entity { entity, fields } => fields
            .iter()
            .find(|(n, _)| n == member)
            .map(|(_, e)| e.clone())
            .ok_or_else(|| Error::unmapped_member(entity, member)),
        SqlExpr::OuterJoined { expr, .. } => entity_field(expr, member),
        _ => Err(Error::unsupported(format!("'{}' accessed on a non-entity", member))),
    }
}

fn owner_keys(owner: &SqlExpr, relationship: &Relationship) -> Result<Vec<SqlExpr>> {
    relationship
        .keys
        .iter()
        .map(|(this_member, _)| entity_field(owner, this_member))
        .collect()
}

/// `related.k1 = owner.k1 AND ...` over the relationship's key pairs.
fn key_condition(related: &SqlExpr, relationship: &Relationship, owner_keys: &[SqlExpr]) -> Result<SqlExpr> {
    let mut condition = None;
    for ((_, related_member), owner_key) in relationship.keys.iter().zip(owner_keys) {
        let field = entity_field(related, related_member)?;
        condition = SqlExpr::and_also(condition, Some(SqlExpr::equal(field, owner_key.clone())));
    }
    condition.ok_or_else(|| {
        Error::AmbiguousRelationship(format!("'{}' declares no join keys", relationship.member))
    })
}

fn with_joins(source: Source, joins: Vec<(Select, SqlExpr)>) -> Source {
    joins.into_iter().fold(source, |left, (right, condition)| {
        Source::Join(Box::new(Join {
            kind: JoinKind::SingletonOuter,
            left,
            right: Source::Select(Box::new(right)),
            condition: Some(condition),
        }))
    })
}

/// The server-side expressions a key is computed from.
fn server_parts(key: SqlExpr, alias: TableAlias, existing: &HashSet<TableAlias>) -> Vec<SqlExpr> {
    ColumnProjector::project(key, Vec::new(), alias, existing)
        .columns
        .into_iter()
        .map(|c| c.expr)
        .collect()
}

/// Pairwise equality where two nulls also match.
fn nulls_equal(left: Vec<SqlExpr>, right: Vec<SqlExpr>) -> Option<SqlExpr> {
    left.into_iter().zip(right).fold(None, |acc, (a, b)| {
        let both_null = SqlExpr::binary(
            BinaryOp::And,
            SqlExpr::IsNull(Box::new(a.clone())),
            SqlExpr::IsNull(Box::new(b.clone())),
        );
        let test = SqlExpr::binary(BinaryOp::Or, SqlExpr::equal(a, b), both_null);
        SqlExpr::and_also(acc, Some(test))
    })
}

fn expand_ordering(key: SqlExpr, descending: bool, out: &mut Vec<OrderClause>) {
    match key {
        SqlExpr::New { fields } | SqlExpr::Entity { fields, .. } => {
            for (_, e) in fields {
                expand_ordering(e, descending, out);
            }
        }
        SqlExpr::OuterJoined { expr, .. } => expand_ordering(*expr, descending, out),
        e => out.push(OrderClause::new(e, descending)),
    }
}

/// Split a correlated collection into a join against the rows it depends on.
///
/// An uncorrelated collection becomes a cross join. A collection correlated
/// only through its own WHERE clause becomes an inner join on that clause.
fn decorrelate(
    select: Select,
    left: &HashSet<TableAlias>,
) -> Result<(JoinKind, Option<SqlExpr>, Select)> {
    let refs = gather::referenced_aliases_in_select(&select);
    if refs.is_disjoint(left) {
        return Ok((JoinKind::Cross, None, select));
    }
    let simple = select.take.is_none()
        && select.skip.is_none()
        && !select.distinct
        && select.group_by.is_empty()
        && !AggregateChecker::has_aggregates(&select);
    if simple {
        let mut rest = select;
        let condition = rest.where_clause.take();
        if gather::referenced_aliases_in_select(&rest).is_disjoint(left) {
            // The condition moves above the select, so its own columns must
            // be re-exposed through the select's alias.
            let declared = rest
                .from
                .as_ref()
                .map(gather::declared_aliases)
                .unwrap_or_default();
            let condition = condition.map(|c| {
                let columns = std::mem::take(&mut rest.columns);
                let pc = ColumnProjector::project(c, columns, rest.alias, &declared);
                rest.columns = pc.columns;
                pc.projector
            });
            return Ok((JoinKind::Inner, condition, rest));
        }
    }
    Err(Error::unsupported(
        "collection is correlated with its source outside of a filter",
    ))
}
