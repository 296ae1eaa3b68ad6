//! Entity provider: the entry point that translates, caches and runs queries
//! and writes against one driver.

mod batch;
pub mod driver;
mod write;

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use querykit_proto::{QueryCommand, Value};
use tracing::{debug, trace, warn};

use crate::cache::QueryCache;
use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::execution::{
    Deferred, ExecutionBuilder, Executor, FromObject, Object, QueryPlan, QueryState, Record,
};
use crate::expr::{Bindings, Expr, Lambda, PartialEvaluator};
use crate::ir::Projection;
use crate::language::QueryLanguage;
use crate::mapping::{EntityMapping, QueryMapping};
use crate::police::EntityPolicy;
use crate::translate::QueryTranslator;

pub use batch::BatchResults;
pub use driver::{read_row, Driver, RowCursor};

/// Prefix of the variables holding the key passed to `get_by_id`.
const KEY_PREFIX: &str = "__key";

/// Translates and runs queries over mapped entities.
///
/// The provider is shareable across threads: translation holds no mutable
/// state, the query cache and the prepared-command table are concurrent,
/// and a connection the provider opened itself is closed when the last
/// concurrent user releases it. A connection opened by the caller is left
/// open.
pub struct EntityProvider<D: Driver> {
    driver: D,
    mapping: Box<dyn QueryMapping>,
    language: Box<dyn QueryLanguage>,
    policy: EntityPolicy,
    config: ProviderConfig,
    cache: Option<QueryCache>,
    prepared: DashMap<QueryCommand, u64>,
    connections: Mutex<Connections>,
}

/// Concurrent users of the driver's connection.
#[derive(Debug, Default)]
struct Connections {
    users: usize,
    /// The provider opened the connection and closes it after the last user.
    opened: bool,
}

impl<D: Driver> EntityProvider<D> {
    /// Create a provider with the empty policy and default settings.
    pub fn new(
        driver: D,
        mapping: impl QueryMapping + 'static,
        language: impl QueryLanguage + 'static,
    ) -> Self {
        let config = ProviderConfig::default();
        Self {
            driver,
            mapping: Box::new(mapping),
            language: Box::new(language),
            policy: EntityPolicy::new(),
            cache: cache_for(&config),
            config,
            prepared: DashMap::new(),
            connections: Mutex::new(Connections::default()),
        }
    }

    pub fn with_policy(mut self, policy: EntityPolicy) -> Self {
        self.policy = policy;
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        self
    }

    /// Replace the settings, rebuilding the query cache.
    pub fn with_config(mut self, config: ProviderConfig) -> Self {
        self.cache = cache_for(&config);
        self.config = config;
        self
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn mapping(&self) -> &dyn QueryMapping {
        &*self.mapping
    }

    pub fn language(&self) -> &dyn QueryLanguage {
        &*self.language
    }

    pub fn policy(&self) -> &EntityPolicy {
        &self.policy
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// The compiled query cache, if enabled.
    pub fn cache(&self) -> Option<&QueryCache> {
        self.cache.as_ref()
    }

    /// Number of distinct commands prepared so far.
    pub fn prepared_commands(&self) -> usize {
        self.prepared.len()
    }

    /// How many times `command` has been run.
    pub fn command_uses(&self, command: &QueryCommand) -> u64 {
        self.prepared.get(command).map_or(0, |uses| *uses)
    }

    fn translator(&self) -> QueryTranslator<'_> {
        QueryTranslator::new(
            &*self.mapping,
            &self.policy,
            &*self.language,
            &self.config.translator,
        )
    }

    fn entity(&self, entity: &str) -> Result<&EntityMapping> {
        self.mapping.require_entity(entity)
    }

    /// Translate a query into its legalized projection.
    pub fn translate(&self, expr: &Expr, bindings: &Bindings) -> Result<Projection> {
        self.translator().translate(expr, bindings)
    }

    /// Text of every command the query runs, separated by blank lines.
    pub fn get_query_text(&self, expr: &Expr, bindings: &Bindings) -> Result<String> {
        let (plan, _) = self.compile(expr, bindings)?;
        let texts: Vec<&str> = plan.commands().iter().map(|c| c.text.as_str()).collect();
        Ok(texts.join("\n\n"))
    }

    /// Readable outline of the execution plan of a query.
    pub fn get_query_plan(&self, expr: &Expr, bindings: &Bindings) -> Result<String> {
        let (plan, _) = self.compile(expr, bindings)?;
        Ok(plan.describe())
    }

    /// Partially evaluate a query and find or build its plan.
    ///
    /// Returns the plan with the bindings it must run with: the caller's
    /// values plus any constants the cache lifted out of the query.
    fn compile(&self, expr: &Expr, bindings: &Bindings) -> Result<(Arc<QueryPlan>, Bindings)> {
        trace!(state = %QueryState::Translating, "compiling query");
        let mapping = &*self.mapping;
        let local = move |e: &Expr| mapping.can_be_evaluated_locally(e);
        let evaluated = PartialEvaluator::eval(expr.clone(), bindings, &local)?;

        let translator = self.translator();
        let build = |query: &Expr| -> Result<QueryPlan> {
            let projection = translator.translate_evaluated(query)?;
            ExecutionBuilder::new(translator.linguist()).build(&projection)
        };

        let compiled = match &self.cache {
            Some(cache) => {
                let (template, lifted) = QueryCache::parameterize(evaluated);
                let plan = cache.get_or_compile(template, build)?;
                let mut values = bindings.clone();
                values.extend(&lifted);
                (plan, values)
            }
            None => (Arc::new(build(&evaluated)?), bindings.clone()),
        };
        trace!(state = %QueryState::PlanBuilt, "query compiled");
        Ok(compiled)
    }

    fn run_plan(&self, plan: &QueryPlan, bindings: &Bindings) -> Result<Object> {
        self.do_connected(|| {
            let translator = self.translator();
            self.executor(&translator).execute(plan, bindings)
        })
    }

    fn executor<'e>(&'e self, translator: &'e QueryTranslator<'e>) -> Executor<'e, 'e> {
        Executor::new(&self.driver, translator.linguist(), &self.config).with_prepared(&self.prepared)
    }

    /// Run a query, returning its single result: a list for sequences, an
    /// object or null for element and aggregate operators.
    pub fn execute_scalar(&self, expr: &Expr, bindings: &Bindings) -> Result<Object> {
        let result = self
            .compile(expr, bindings)
            .and_then(|(plan, values)| self.run_plan(&plan, &values));
        match &result {
            Ok(_) => trace!(state = %QueryState::Done, "query finished"),
            Err(e) => debug!(state = %QueryState::Failed, error = %e, "query failed"),
        }
        result
    }

    /// Run a query, returning its results as a sequence.
    pub fn execute(&self, expr: &Expr, bindings: &Bindings) -> Result<Vec<Object>> {
        Ok(match self.execute_scalar(expr, bindings)? {
            Object::List(items) => items,
            other => vec![other],
        })
    }

    /// Run a query and convert each result.
    pub fn query<T: FromObject>(&self, expr: &Expr, bindings: &Bindings) -> Result<Vec<T>> {
        self.execute(expr, bindings)?
            .into_iter()
            .map(T::from_object)
            .collect()
    }

    /// Load one entity by its primary key values, in key column order.
    ///
    /// Returns null when no row matches.
    pub fn get_by_id(&self, entity: &str, key: &[Value]) -> Result<Object> {
        let mapping = self.entity(entity)?;
        let members: Vec<&str> = mapping.primary_key().map(|c| c.member.as_str()).collect();
        if members.is_empty() {
            return Err(Error::unsupported(format!("entity '{}' has no primary key", entity)));
        }
        if members.len() != key.len() {
            return Err(Error::unsupported(format!(
                "entity '{}' has a {}-part key, {} values given",
                entity,
                members.len(),
                key.len()
            )));
        }

        let mut bindings = Bindings::new();
        let mut predicate: Option<Expr> = None;
        for (i, (member, value)) in members.iter().zip(key).enumerate() {
            let name = format!("{}{}", KEY_PREFIX, i);
            let test = Expr::param("e").member(*member).equals(Expr::var(name.as_str()));
            predicate = Some(match predicate {
                Some(p) => p.and(test),
                None => test,
            });
            bindings.insert(name, value.clone());
        }
        let predicate = predicate.ok_or_else(|| Error::evaluation("empty key predicate"))?;
        let query = Expr::table(entity)
            .filter(Lambda::new("e", predicate))
            .single_or_default();
        self.execute_scalar(&query, &bindings)
    }

    /// Run the query behind a deferred member.
    pub fn load_deferred(&self, deferred: &Deferred) -> Result<Object> {
        self.do_connected(|| {
            let translator = self.translator();
            self.executor(&translator).load(deferred)
        })
    }

    /// Run raw command text, returning the number of affected rows.
    pub fn execute_command(&self, text: &str) -> Result<u64> {
        self.do_connected(|| {
            if self.config.log_commands {
                debug!(command = text, "executing command");
            }
            self.driver.execute_script(text)
        })
    }

    /// Check if a caller currently holds the connection open.
    pub fn is_connected(&self) -> bool {
        self.connections.lock().users > 0
    }

    /// Run `f` with the connection open.
    ///
    /// Calls nest: the connection opens on the outermost call and closes
    /// when it returns, unless it was already open before that call.
    pub fn do_connected<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _connection = self.connect()?;
        f()
    }

    /// Run `f` inside a transaction.
    ///
    /// A transaction is begun only if none is active; it commits when `f`
    /// succeeds and rolls back when it fails. Inside an active transaction
    /// `f` simply joins it.
    pub fn do_transacted<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.do_connected(|| {
            if self.driver.in_transaction() {
                return f();
            }
            self.driver.begin()?;
            debug!("transaction started");
            match f() {
                Ok(value) => {
                    self.driver.commit()?;
                    debug!("transaction committed");
                    Ok(value)
                }
                Err(e) => {
                    if let Err(rollback) = self.driver.rollback() {
                        warn!(error = %rollback, "rollback failed");
                    } else {
                        debug!(error = %e, "transaction rolled back");
                    }
                    Err(e)
                }
            }
        })
    }

    fn connect(&self) -> Result<ConnectionGuard<'_, D>> {
        let mut connections = self.connections.lock();
        if connections.users == 0 {
            connections.opened = !self.driver.is_open();
            if connections.opened {
                self.driver.open()?;
                debug!("connection opened");
            }
        }
        connections.users += 1;
        Ok(ConnectionGuard { provider: self })
    }

    fn release(&self) {
        let mut connections = self.connections.lock();
        connections.users = connections.users.saturating_sub(1);
        if connections.users == 0 && connections.opened {
            connections.opened = false;
            if self.driver.is_open() {
                match self.driver.close() {
                    Ok(()) => debug!("connection closed"),
                    Err(e) => warn!(error = %e, "failed to close connection"),
                }
            }
        }
    }
}

struct ConnectionGuard<'p, D: Driver> {
    provider: &'p EntityProvider<D>,
}

impl<D: Driver> Drop for ConnectionGuard<'_, D> {
    fn drop(&mut self) {
        self.provider.release();
    }
}

fn cache_for(config: &ProviderConfig) -> Option<QueryCache> {
    config
        .has_cache()
        .then(|| QueryCache::new(config.cache_capacity))
}

/// Asynchronous variants, run on the blocking thread pool.
impl<D: Driver + 'static> EntityProvider<D> {
    async fn spawn<T, F>(self: Arc<Self>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&EntityProvider<D>) -> Result<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(move || f(&self))
            .await
            .map_err(Error::driver)?
    }

    pub async fn execute_async(self: Arc<Self>, expr: Expr, bindings: Bindings) -> Result<Vec<Object>> {
        self.spawn(move |provider| provider.execute(&expr, &bindings)).await
    }

    pub async fn insert_async(
        self: Arc<Self>,
        entity: String,
        item: Record,
        result: Option<Lambda>,
    ) -> Result<Object> {
        self.spawn(move |provider| provider.insert(&entity, &item, result.as_ref()))
            .await
    }

    pub async fn update_async(
        self: Arc<Self>,
        entity: String,
        item: Record,
        check: Option<Lambda>,
        result: Option<Lambda>,
    ) -> Result<Object> {
        self.spawn(move |provider| provider.update(&entity, &item, check.as_ref(), result.as_ref()))
            .await
    }

    pub async fn insert_or_update_async(
        self: Arc<Self>,
        entity: String,
        item: Record,
        check: Option<Lambda>,
        result: Option<Lambda>,
    ) -> Result<Object> {
        self.spawn(move |provider| {
            provider.insert_or_update(&entity, &item, check.as_ref(), result.as_ref())
        })
        .await
    }

    pub async fn delete_async(
        self: Arc<Self>,
        entity: String,
        item: Record,
        check: Option<Lambda>,
    ) -> Result<Object> {
        self.spawn(move |provider| provider.delete(&entity, &item, check.as_ref()))
            .await
    }
}
