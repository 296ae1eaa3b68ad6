//! Compiled query cache keyed by query shape.

use std::cell::RefCell;
use std::sync::Arc;

use querykit_proto::Value;
use tracing::trace;

use crate::error::{Error, Result};
use crate::execution::QueryPlan;
use crate::expr::{Bindings, Expr, Lambda};

use super::mru::{CacheStats, MruCache};

/// Prefix of the variables constants are lifted into.
pub const LIFTED_PREFIX: &str = "__c";

#[derive(Clone)]
struct CachedQuery {
    template: Expr,
    plan: Option<Arc<QueryPlan>>,
}

/// Caches execution plans for query templates.
///
/// Constants of a partially evaluated query are lifted into variables, so
/// queries differing only in their constant values share one template and
/// one compiled plan.
pub struct QueryCache {
    queries: MruCache<CachedQuery>,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            queries: MruCache::new(capacity, |a: &CachedQuery, b: &CachedQuery| a.template == b.template),
        }
    }

    /// Replace the constants of `expr` with variables `__c0, __c1, ...`,
    /// returning the template and the lifted values.
    ///
    /// Null and boolean constants stay inline: translation folds them into
    /// IS NULL tests and simplified predicates.
    pub fn parameterize(expr: Expr) -> (Expr, Bindings) {
        let lifted = RefCell::new(Vec::new());
        let template = lift(expr, &lifted);
        let bindings = lifted
            .into_inner()
            .into_iter()
            .enumerate()
            .fold(Bindings::new(), |bindings, (i, value)| {
                bindings.with(format!("{}{}", LIFTED_PREFIX, i), value)
            });
        (template, bindings)
    }

    /// The plan cached for `template`, compiling and caching it on a miss.
    pub fn get_or_compile(
        &self,
        template: Expr,
        compile: impl FnOnce(&Expr) -> Result<QueryPlan>,
    ) -> Result<Arc<QueryPlan>> {
        let probe = CachedQuery { template, plan: None };
        let (found, cached) = self.queries.lookup(probe, false);
        if found {
            trace!("query cache hit");
            return cached.plan.ok_or_else(|| Error::evaluation("cached query has no plan"));
        }

        let plan = Arc::new(compile(&cached.template)?);
        let entry = CachedQuery {
            template: cached.template,
            plan: Some(plan),
        };
        // Another thread may have compiled the same template meanwhile; its
        // entry wins.
        let (_, canonical) = self.queries.lookup(entry, true);
        canonical.plan.ok_or_else(|| Error::evaluation("cached query has no plan"))
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn stats(&self) -> &CacheStats {
        self.queries.stats()
    }

    pub fn clear(&self) {
        self.queries.clear()
    }
}

fn liftable(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(_))
}

fn lift(expr: Expr, lifted: &RefCell<Vec<Value>>) -> Expr {
    let r = |e: Expr| lift(e, lifted);
    let rl = |l: Lambda| Lambda {
        parameters: l.parameters,
        body: Box::new(lift(*l.body, lifted)),
    };
    match expr {
        Expr::Constant(value) if liftable(&value) => {
            let mut values = lifted.borrow_mut();
            let name = format!("{}{}", LIFTED_PREFIX, values.len());
            values.push(value);
            Expr::Variable(name)
        }
        Expr::Member(inner, name) => Expr::Member(Box::new(r(*inner)), name),
        Expr::Binary(op, a, b) => Expr::Binary(op, Box::new(r(*a)), Box::new(r(*b))),
        Expr::Unary(op, a) => Expr::Unary(op, Box::new(r(*a))),
        Expr::Conditional(t, a, b) => Expr::Conditional(Box::new(r(*t)), Box::new(r(*a)), Box::new(r(*b))),
        Expr::Call(f, args) => Expr::Call(f, args.into_iter().map(r).collect()),
        Expr::New(fields) => Expr::New(fields.into_iter().map(|(n, e)| (n, r(e))).collect()),
        Expr::Query(op) => Expr::Query(Box::new(op.map(&r, &rl))),
        leaf => leaf,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{Argument, Reader};
    use querykit_proto::QueryCommand;

    fn city_query(city: &str) -> Expr {
        Expr::table("Customer").filter(Lambda::new("c", Expr::param("c").member("City").equals(city)))
    }

    fn plan(text: &str) -> QueryPlan {
        QueryPlan {
            command: QueryCommand::new(text, Vec::new()),
            arguments: vec![Argument::Variable("__c0".into())],
            reader: Reader::Constant(Value::Null),
            aggregator: None,
            streaming: true,
        }
    }

    #[test]
    fn test_parameterize_lifts_constants() {
        let (template, bindings) = QueryCache::parameterize(city_query("London"));
        let (other, _) = QueryCache::parameterize(city_query("Paris"));
        assert_eq!(template, other);
        assert_eq!(bindings.get("__c0"), Some(&Value::from("London")));
        assert_eq!(bindings.len(), 1);
    }

    #[test]
    fn test_null_and_bool_stay_inline() {
        let query = Expr::table("Customer").filter(Lambda::new(
            "c",
            Expr::param("c").member("Region").equals(Expr::null()).and(Expr::constant(true)),
        ));
        let (template, bindings) = QueryCache::parameterize(query.clone());
        assert_eq!(template, query);
        assert!(bindings.is_empty());
    }

    #[test]
    fn test_same_shape_compiles_once() {
        let cache = QueryCache::new(4);
        let mut compiled = 0;
        for city in ["London", "Paris", "Berlin"] {
            let (template, _) = QueryCache::parameterize(city_query(city));
            let plan = cache
                .get_or_compile(template, |_| {
                    compiled += 1;
                    Ok(plan("SELECT"))
                })
                .unwrap();
            assert_eq!(plan.command.text, "SELECT");
        }
        assert_eq!(compiled, 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().hits(), 2);
    }

    #[test]
    fn test_failed_compile_is_not_cached() {
        let cache = QueryCache::new(4);
        let (template, _) = QueryCache::parameterize(city_query("London"));
        assert!(cache
            .get_or_compile(template, |_| Err(Error::unsupported("no")))
            .is_err());
        assert!(cache.is_empty());
    }
}
