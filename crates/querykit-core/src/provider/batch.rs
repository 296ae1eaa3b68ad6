//! Results of a batched write.

use std::fmt;

use crate::error::Result;
use crate::execution::Object;

enum Results<'p> {
    Eager(std::vec::IntoIter<Result<Object>>),
    Streamed(Box<dyn Iterator<Item = Result<Object>> + 'p>),
}

/// One result per batch item, in item order.
///
/// When the batch call opened the connection itself every item is written
/// before the call returns. Otherwise items are written as the results are
/// consumed, on the caller's open connection.
pub struct BatchResults<'p> {
    results: Results<'p>,
}

impl<'p> BatchResults<'p> {
    pub(crate) fn eager(results: Vec<Result<Object>>) -> Self {
        Self {
            results: Results::Eager(results.into_iter()),
        }
    }

    pub(crate) fn streamed(results: impl Iterator<Item = Result<Object>> + 'p) -> Self {
        Self {
            results: Results::Streamed(Box::new(results)),
        }
    }

    /// Check if items are written lazily.
    pub fn is_streamed(&self) -> bool {
        matches!(self.results, Results::Streamed(_))
    }
}

impl Iterator for BatchResults<'_> {
    type Item = Result<Object>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.results {
            Results::Eager(results) => results.next(),
            Results::Streamed(results) => results.next(),
        }
    }
}

impl fmt::Debug for BatchResults<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchResults")
            .field("streamed", &self.is_streamed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use querykit_proto::Value;

    #[test]
    fn test_eager_results_keep_order() {
        let results = BatchResults::eager(vec![
            Ok(Object::Value(Value::Int64(1))),
            Ok(Object::Value(Value::Int64(0))),
        ]);
        assert!(!results.is_streamed());
        let affected: Vec<Object> = results.map(|r| r.unwrap()).collect();
        assert_eq!(affected, vec![Object::Value(Value::Int64(1)), Object::Value(Value::Int64(0))]);
    }

    #[test]
    fn test_streamed_results_are_lazy() {
        let mut produced = 0;
        {
            let results = BatchResults::streamed((0..3).map(|i| {
                produced += 1;
                Ok(Object::Value(Value::Int64(i)))
            }));
            assert!(results.is_streamed());
            assert_eq!(results.take(2).count(), 2);
        }
        assert_eq!(produced, 2);
    }
}
