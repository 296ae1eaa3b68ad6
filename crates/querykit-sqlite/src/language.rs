//! SQLite dialect.

use querykit_core::QueryLanguage;

/// `LIMIT/OFFSET` dialect with `last_insert_rowid()` for generated keys.
#[derive(Debug, Clone, Copy)]
pub struct SqliteLanguage {
    native_offset: bool,
}

impl SqliteLanguage {
    pub fn new() -> Self {
        Self { native_offset: true }
    }

    /// Rewrite skips into row-number filters instead of `OFFSET`.
    pub fn with_emulated_offset() -> Self {
        Self { native_offset: false }
    }
}

impl Default for SqliteLanguage {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryLanguage for SqliteLanguage {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn allows_offset(&self) -> bool {
        self.native_offset
    }

    fn write_limit(&self, out: &mut String, skip: Option<&str>, take: Option<&str>) {
        match (skip, take) {
            (Some(skip), Some(take)) => out.push_str(&format!("LIMIT {} OFFSET {}", take, skip)),
            // SQLite has no OFFSET without LIMIT; -1 means no limit.
            (Some(skip), None) => out.push_str(&format!("LIMIT -1 OFFSET {}", skip)),
            (None, Some(take)) => out.push_str(&format!("LIMIT {}", take)),
            (None, None) => {}
        }
    }

    fn generated_key_query(&self) -> Option<&str> {
        Some("SELECT last_insert_rowid()")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(skip: Option<&str>, take: Option<&str>) -> String {
        let mut out = String::new();
        SqliteLanguage::new().write_limit(&mut out, skip, take);
        out
    }

    #[test]
    fn test_limit_clauses() {
        assert_eq!(limit(Some("@p0"), Some("@p1")), "LIMIT @p1 OFFSET @p0");
        assert_eq!(limit(Some("@p0"), None), "LIMIT -1 OFFSET @p0");
        assert_eq!(limit(None, Some("@p0")), "LIMIT @p0");
        assert_eq!(limit(None, None), "");
    }

    #[test]
    fn test_offset_emulation_flag() {
        assert!(SqliteLanguage::new().allows_offset());
        assert!(!SqliteLanguage::with_emulated_offset().allows_offset());
        assert!(SqliteLanguage::new().supports_row_number());
    }
}
