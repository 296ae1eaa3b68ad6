//! Translation pipeline: logical query in, legalized projection out.

mod aggregate;
mod binder;
mod order_by;

use tracing::{debug, trace};

use crate::cleanup;
use crate::config::TranslatorConfig;
use crate::error::{Error, Result};
use crate::expr::{Bindings, Expr, PartialEvaluator};
use crate::ir::{AliasGenerator, Projection, SqlExpr};
use crate::language::{Linguist, QueryLanguage};
use crate::mapping::QueryMapping;
use crate::police::{EntityPolicy, QueryPolice};

pub use aggregate::AggregateRewriter;
pub use binder::QueryBinder;
pub use order_by::OrderByRewriter;

/// Everything a translation reads: mapping, policy, dialect and settings.
///
/// Holds no mutable state, so one translator serves concurrent translations.
pub struct QueryTranslator<'a> {
    mapping: &'a dyn QueryMapping,
    policy: &'a EntityPolicy,
    linguist: Linguist<'a>,
    config: &'a TranslatorConfig,
}

impl<'a> QueryTranslator<'a> {
    pub fn new(
        mapping: &'a dyn QueryMapping,
        policy: &'a EntityPolicy,
        language: &'a dyn QueryLanguage,
        config: &'a TranslatorConfig,
    ) -> Self {
        Self {
            mapping,
            policy,
            linguist: Linguist::new(language, config),
            config,
        }
    }

    pub fn linguist(&self) -> &Linguist<'a> {
        &self.linguist
    }

    pub fn mapping(&self) -> &'a dyn QueryMapping {
        self.mapping
    }

    pub fn policy(&self) -> &'a EntityPolicy {
        self.policy
    }

    /// Evaluate the locally computable parts of `expr`, then translate it.
    pub fn translate(&self, expr: &Expr, bindings: &Bindings) -> Result<Projection> {
        let mapping = self.mapping;
        let local = move |e: &Expr| mapping.can_be_evaluated_locally(e);
        let evaluated = PartialEvaluator::eval(expr.clone(), bindings, &local)?;
        self.translate_evaluated(&evaluated)
    }

    /// Translate an already partially evaluated query.
    ///
    /// Unbound variables stay symbolic and become command parameters.
    pub fn translate_evaluated(&self, expr: &Expr) -> Result<Projection> {
        let mut aliases = AliasGenerator::new();
        let projection = QueryBinder::new(self.mapping, self.policy, &mut aliases).bind(expr)?;
        let bound = SqlExpr::Projection(Box::new(projection));

        let rewritten = AggregateRewriter::rewrite(bound);
        let rewritten = OrderByRewriter::rewrite(rewritten);
        let cleaned = cleanup::clean(rewritten);

        let police = QueryPolice::new(self.mapping, self.policy, self.config);
        let policed = police.apply(cleaned, &mut aliases)?;
        let legal = self.linguist.legalize(policed, &mut aliases)?;
        debug!(language = self.linguist.language().name(), "query translated");

        match legal {
            SqlExpr::Projection(p) => {
                trace!(projection = ?p, "translated projection");
                Ok(*p)
            }
            other => Err(Error::unsupported(format!(
                "translation did not produce a projection: {:?}",
                other
            ))),
        }
    }
}
