use crate::error::ApiResult;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
pub const HISTORIC_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes GraphQL queries for the core.
///
/// Implementations return the `data` object of the response. Callers in this
/// crate treat an error, `null` or an empty object the same way: nothing to
/// update this cycle.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn execute(&self, query: &str, timeout: Duration) -> ApiResult<Value>;

    /// Refreshes account level info (user, list of homes).
    ///
    /// Sources without an account concept can keep the default.
    async fn update_account_info(&self) -> ApiResult<()> {
        Ok(())
    }

    /// Name used in log lines
    fn name(&self) -> &str;
}

/// Runs a query and flattens every failure into `None`, logging the cause.
pub(crate) async fn execute_or_none(
    source: &dyn DataSource,
    query: &str,
    timeout: Duration,
) -> Option<Value> {
    match source.execute(query, timeout).await {
        Ok(Value::Null) => None,
        Ok(Value::Object(map)) if map.is_empty() => None,
        Ok(data) => Some(data),
        Err(e) => {
            tracing::error!("Query via {} failed: {e}", source.name());
            None
        }
    }
}

/// Walks `viewer.home.<path...>`, returning `None` at the first missing or null step.
pub(crate) fn home_field<'a>(data: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut node = data.get("viewer")?.get("home")?;
    for key in path {
        node = node.get(*key)?;
    }
    if node.is_null() {
        None
    } else {
        Some(node)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedSource;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_execute_or_none_flattens_falsy_results() {
        let source = ScriptedSource::new();
        source.push(Value::Null);
        source.push(json!({}));
        source.push_error();
        source.push(json!({"viewer": {}}));

        assert!(execute_or_none(&source, "q", DEFAULT_QUERY_TIMEOUT).await.is_none());
        assert!(execute_or_none(&source, "q", DEFAULT_QUERY_TIMEOUT).await.is_none());
        assert!(execute_or_none(&source, "q", DEFAULT_QUERY_TIMEOUT).await.is_none());
        assert!(execute_or_none(&source, "q", DEFAULT_QUERY_TIMEOUT).await.is_some());
        assert_eq!(source.query_count(), 4);
    }

    #[test]
    fn test_home_field() {
        let data = json!({"viewer": {"home": {"a": {"b": 3, "c": null}}}});
        assert_eq!(home_field(&data, &["a", "b"]), Some(&json!(3)));
        assert_eq!(home_field(&data, &["a", "c"]), None);
        assert_eq!(home_field(&data, &["x"]), None);
        assert_eq!(home_field(&json!({}), &[]), None);
    }
}
