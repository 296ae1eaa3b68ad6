//! Language customization point and legalization.
//!
//! A [`QueryLanguage`] describes what the target dialect can express; the
//! [`Linguist`] rewrites translated trees into that subset and renders them.

mod aggregate_checker;
mod formatter;
mod parameterizer;
mod skip_to_row_number;

use std::fmt;

use querykit_proto::DbTypeSystem;

use crate::config::TranslatorConfig;
use crate::error::Result;
use crate::ir::{AliasGenerator, Select, SqlExpr, WriteCommand};

pub use aggregate_checker::AggregateChecker;
pub use formatter::SqlFormatter;
pub use parameterizer::Parameterizer;
pub use skip_to_row_number::{SkipToRowNumberRewriter, ROW_NUMBER_COLUMN};

const RESERVED: &[&str] = &[
    "ALL", "AND", "AS", "ASC", "BETWEEN", "BY", "CASE", "CROSS", "DEFAULT", "DELETE", "DESC",
    "DISTINCT", "ELSE", "END", "EXISTS", "FROM", "GROUP", "HAVING", "IN", "INDEX", "INNER",
    "INSERT", "INTO", "IS", "JOIN", "KEY", "LEFT", "LIKE", "LIMIT", "NOT", "NULL", "OFFSET", "ON",
    "OR", "ORDER", "OUTER", "SELECT", "SET", "TABLE", "THEN", "TO", "UNION", "UPDATE", "VALUES",
    "WHEN", "WHERE",
];

/// Quote an identifier only when it is not a plain, unreserved name.
pub fn quote_identifier(name: &str) -> String {
    let plain = name
        .chars()
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !RESERVED.iter().any(|r| r.eq_ignore_ascii_case(name));
    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Dialect capabilities and syntax.
pub trait QueryLanguage: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Check if the dialect can skip rows natively.
    fn allows_offset(&self) -> bool;

    /// Check if the dialect has `ROW_NUMBER() OVER (...)`.
    fn supports_row_number(&self) -> bool {
        true
    }

    fn parameter_prefix(&self) -> &str {
        "@"
    }

    fn type_system(&self) -> DbTypeSystem {
        DbTypeSystem
    }

    fn quote(&self, name: &str) -> String {
        quote_identifier(name)
    }

    /// Append the row-limiting clause for rendered skip and take operands.
    fn write_limit(&self, out: &mut String, skip: Option<&str>, take: Option<&str>);

    /// Query returning the key generated by the last insert, if any.
    fn generated_key_query(&self) -> Option<&str> {
        None
    }
}

/// ANSI dialect: `FETCH FIRST`, offsets emulated with row numbers.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardLanguage;

impl QueryLanguage for StandardLanguage {
    fn name(&self) -> &str {
        "standard"
    }

    fn allows_offset(&self) -> bool {
        false
    }

    fn write_limit(&self, out: &mut String, skip: Option<&str>, take: Option<&str>) {
        match (skip, take) {
            (Some(skip), Some(take)) => out.push_str(&format!(
                "OFFSET {} ROWS FETCH NEXT {} ROWS ONLY",
                skip, take
            )),
            (Some(skip), None) => out.push_str(&format!("OFFSET {} ROWS", skip)),
            (None, Some(take)) => out.push_str(&format!("FETCH FIRST {} ROWS ONLY", take)),
            (None, None) => {}
        }
    }
}

/// Applies language-specific rewrites and renders commands.
pub struct Linguist<'a> {
    language: &'a dyn QueryLanguage,
    emulate_offset: bool,
}

impl<'a> Linguist<'a> {
    pub fn new(language: &'a dyn QueryLanguage, config: &TranslatorConfig) -> Self {
        Self {
            language,
            emulate_offset: config.emulate_offset || !language.allows_offset(),
        }
    }

    pub fn language(&self) -> &'a dyn QueryLanguage {
        self.language
    }

    /// Check if skips are rewritten into row-number filters.
    pub fn emulates_offset(&self) -> bool {
        self.emulate_offset
    }

    /// Rewrite the tree into constructs the language supports.
    pub fn legalize(&self, expr: SqlExpr, aliases: &mut AliasGenerator) -> Result<SqlExpr> {
        if !self.emulate_offset {
            return Ok(expr);
        }
        SkipToRowNumberRewriter::rewrite(expr, aliases, self.language.supports_row_number())
    }

    /// Parameterize and render one select command.
    pub fn format(&self, select: Select) -> Result<(String, Select)> {
        let select = Parameterizer::parameterize(select, self.language.type_system());
        let text = SqlFormatter::format(self.language, &select)?;
        Ok((text, select))
    }

    /// Parameterize and render one write command.
    pub fn format_write(&self, command: WriteCommand) -> Result<(String, WriteCommand)> {
        let command = Parameterizer::parameterize_write(command, self.language.type_system());
        let text = SqlFormatter::format_write(self.language, &command)?;
        Ok((text, command))
    }
}
