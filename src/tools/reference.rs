use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use schemars::JsonSchema;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ToolError;
use crate::llm::TextMatcher;
use crate::prompts;

use super::ToolInput;

pub const DESCRIPTION: &str = r#"Search the Finnish food composition reference database. Use Finnish descriptions of foods or ingredients, e.g. "Fazer juuri paistettu kanelipulla" or "Vadelman makuinen mysli". The tool only finds matching items; do all analysis and calculations yourself.

Results contain nutritional values per 100 g or 100 ml and the serving units available for each match.

Example queries:
- "syöntikypsä avokado"
- "hunaja fileesuikale tai hunajalla maustettu kanafile"
- "pakastetut mansikat"
- "Valio pehmeä maitorahka tai jokin muu vähärasvainen maitorahka (alle 10% rasvaa)""#;

const NO_MATCHES: &str = "Ei osumia";

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct SearchReferenceInput {
    /// The query to search for in the reference database.
    pub query: String,
}

impl ToolInput for SearchReferenceInput {}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceItem {
    pub id: String,
    pub name: String,
    pub class: Option<String>,
    pub process: Option<String>,
    pub nutrients: ReferenceNutrients,
    pub units: Vec<ServingUnit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceNutrients {
    pub kcal: Option<f64>,
    pub protein: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServingUnit {
    pub unit: String,
    pub description: String,
    pub mass: f64,
}

/// Fans a query out over the reference dataset, one matching request per
/// batch. The dataset is read from disk on first use and kept for the life
/// of the process.
pub struct ReferenceSearch {
    matcher: Arc<dyn TextMatcher>,
    path: Option<PathBuf>,
    dataset: OnceCell<Arc<Vec<ReferenceItem>>>,
    batch_size: usize,
}

impl ReferenceSearch {
    pub fn new(matcher: Arc<dyn TextMatcher>, path: PathBuf, batch_size: usize) -> Self {
        Self {
            matcher,
            path: Some(path),
            dataset: OnceCell::new(),
            batch_size: batch_size.max(1),
        }
    }

    /// A search over an already loaded dataset.
    pub fn with_items(
        matcher: Arc<dyn TextMatcher>,
        items: Vec<ReferenceItem>,
        batch_size: usize,
    ) -> Self {
        Self {
            matcher,
            path: None,
            dataset: OnceCell::new_with(Some(Arc::new(items))),
            batch_size: batch_size.max(1),
        }
    }

    async fn dataset(&self) -> Result<Arc<Vec<ReferenceItem>>, ToolError> {
        self.dataset
            .get_or_try_init(|| async {
                let path = self
                    .path
                    .as_ref()
                    .ok_or_else(|| ToolError::Execution("Reference database is not configured.".into()))?;
                let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
                    warn!(path = %path.display(), error = %e, "failed to read reference dataset");
                    ToolError::Execution("Reference database is unavailable.".into())
                })?;
                let items: Vec<ReferenceItem> = serde_json::from_str(&raw).map_err(|e| {
                    warn!(path = %path.display(), error = %e, "failed to parse reference dataset");
                    ToolError::Execution("Reference database is unavailable.".into())
                })?;
                info!(items = items.len(), "reference dataset loaded");
                Ok(Arc::new(items))
            })
            .await
            .cloned()
    }

    pub async fn search(&self, query: &str, cancel: &CancellationToken) -> Result<String, ToolError> {
        let dataset = self.dataset().await?;
        if dataset.is_empty() {
            return Ok(NO_MATCHES.to_string());
        }

        let requests = dataset.chunks(self.batch_size).map(|batch| {
            let prompt = prompts::reference_match_prompt(query, batch);
            self.matcher.complete(prompt)
        });
        debug!(query, batches = dataset.len().div_ceil(self.batch_size), "searching reference dataset");

        let results = tokio::select! {
            results = join_all(requests) => results,
            _ = cancel.cancelled() => {
                return Err(ToolError::Execution("Search cancelled.".into()));
            }
        };

        let mut sections = Vec::new();
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(text) => sections.push(format!("Result set {}:\n{}", index + 1, text)),
                Err(e) => warn!(batch = index + 1, error = %e, "reference search batch failed"),
            }
        }
        if sections.is_empty() {
            return Err(ToolError::Execution("Reference search failed.".into()));
        }
        Ok(sections.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers with the first item name of the batch; fails on a chosen one.
    struct FirstName {
        calls: AtomicUsize,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl TextMatcher for FirstName {
        async fn complete(&self, prompt: String) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // The instructions carry their own "Name:" example line.
            let database = prompt
                .split_once("Database:\n")
                .map_or("", |(_, database)| database);
            let first = database
                .lines()
                .find_map(|line| line.strip_prefix("Name: "))
                .unwrap_or_default()
                .to_string();
            if self.fail_on.is_some_and(|name| first.starts_with(name)) {
                return Err(LlmError::Stream("boom".into()));
            }
            Ok(first)
        }
    }

    fn items(n: usize) -> Vec<ReferenceItem> {
        (0..n)
            .map(|i| ReferenceItem {
                id: i.to_string(),
                name: format!("item{}", i),
                class: None,
                process: None,
                nutrients: ReferenceNutrients {
                    kcal: Some(1.0),
                    protein: None,
                },
                units: vec![],
            })
            .collect()
    }

    #[tokio::test]
    async fn test_one_request_per_batch_in_order() {
        let matcher = Arc::new(FirstName {
            calls: AtomicUsize::new(0),
            fail_on: None,
        });
        let search = ReferenceSearch::with_items(matcher.clone(), items(1200), 512);

        let out = search.search("kaura", &CancellationToken::new()).await.unwrap();
        assert_eq!(matcher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            out,
            "Result set 1:\nitem0 (null, null)\n\nResult set 2:\nitem512 (null, null)\n\nResult set 3:\nitem1024 (null, null)"
        );
    }

    #[tokio::test]
    async fn test_failed_batch_is_omitted() {
        let matcher = Arc::new(FirstName {
            calls: AtomicUsize::new(0),
            fail_on: Some("item512 "),
        });
        let search = ReferenceSearch::with_items(matcher, items(1200), 512);

        let out = search.search("kaura", &CancellationToken::new()).await.unwrap();
        assert!(out.contains("Result set 1:"));
        assert!(!out.contains("Result set 2:"));
        assert!(out.contains("Result set 3:"));
    }

    #[tokio::test]
    async fn test_all_batches_failing_is_an_error() {
        let matcher = Arc::new(FirstName {
            calls: AtomicUsize::new(0),
            fail_on: Some("item"),
        });
        let search = ReferenceSearch::with_items(matcher, items(10), 4);

        let err = search.search("kaura", &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "Error: Reference search failed.");
    }

    #[tokio::test]
    async fn test_dataset_is_loaded_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reference.json");
        std::fs::write(
            &path,
            r#"[{"id":"1","name":"Banaani","class":"Hedelmät","process":"kuorittu","nutrients":{"kcal":89.0,"protein":null},"units":[{"unit":"KPL_M","description":"keskikokoinen","mass":125.0}]}]"#,
        )
        .unwrap();
        let matcher = Arc::new(FirstName {
            calls: AtomicUsize::new(0),
            fail_on: None,
        });
        let search = ReferenceSearch::new(matcher, path, 512);

        let out = search.search("banaani", &CancellationToken::new()).await.unwrap();
        assert_eq!(out, "Result set 1:\nBanaani (Hedelmät, kuorittu)");
    }
}
