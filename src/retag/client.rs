use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::debug;
use url::Url;

use crate::api::{DictionariesResponse, TagRequest, TagResponse};
use crate::db::Database;
use crate::matcher::MatchSpan;
use crate::tagger::{DictionaryInfo, DictionaryVersions, MatchService, TaggerRegistry};
use crate::TARGET_WEB_REQUEST;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Spans of several texts tagged with one dictionary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaggedElements {
    /// One entry per input text, in input order.
    pub spans: Vec<Vec<MatchSpan>>,
    /// Versions of the tagger that produced every entry of `spans`, when the
    /// client can pin one.
    pub versions: Option<DictionaryVersions>,
}

/// What the retag sweep needs from a tag service.
#[async_trait]
pub trait TagClient: Send + Sync {
    async fn tag(&self, dictionary: &str, text: &str) -> Result<Vec<MatchSpan>>;

    /// Tags `texts` with one dictionary, at most `concurrency` requests at a time.
    async fn tag_elements(
        &self,
        dictionary: &str,
        texts: &[&str],
        concurrency: usize,
    ) -> Result<TaggedElements> {
        let futures: Vec<_> = texts.iter().map(|&text| self.tag(dictionary, text)).collect();
        let spans = stream::iter(futures)
            .buffered(concurrency.max(1))
            .try_collect()
            .await?;
        Ok(TaggedElements { spans, versions: None })
    }

    /// Rebuilds stale dictionaries and returns the resulting registry state.
    async fn update_dictionaries(&self) -> Result<Vec<DictionaryInfo>>;

    async fn list_dictionaries(&self) -> Result<Vec<DictionaryInfo>>;
}

/// Tags in-process against a registry.
#[derive(Clone)]
pub struct LocalTagClient {
    service: MatchService,
    db: Database,
}

impl LocalTagClient {
    pub fn new(registry: Arc<TaggerRegistry>, db: Database) -> Self {
        LocalTagClient {
            service: MatchService::new(registry),
            db,
        }
    }
}

#[async_trait]
impl TagClient for LocalTagClient {
    async fn tag(&self, dictionary: &str, text: &str) -> Result<Vec<MatchSpan>> {
        Ok(self.service.tag(dictionary, text)?)
    }

    async fn tag_elements(
        &self,
        dictionary: &str,
        texts: &[&str],
        _concurrency: usize,
    ) -> Result<TaggedElements> {
        // One tagger for every text, even if a reload swaps it meanwhile
        let tagger = self.service.registry().current(dictionary)?;
        Ok(TaggedElements {
            spans: texts.iter().map(|text| tagger.scan(text)).collect(),
            versions: Some(tagger.versions),
        })
    }

    async fn update_dictionaries(&self) -> Result<Vec<DictionaryInfo>> {
        self.service
            .registry()
            .reload(&self.db)
            .await
            .context("Failed to reload dictionaries")?;
        Ok(self.service.registry().dictionaries())
    }

    async fn list_dictionaries(&self) -> Result<Vec<DictionaryInfo>> {
        Ok(self.service.registry().dictionaries())
    }
}

/// Tags over HTTP against a running tag service.
#[derive(Clone)]
pub struct RemoteTagClient {
    client: reqwest::Client,
    base: Url,
}

impl RemoteTagClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base = Url::parse(base_url).with_context(|| format!("Invalid service URL: {}", base_url))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(RemoteTagClient { client, base })
    }

    pub fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("Invalid endpoint path: {}", path))
    }

    async fn dictionaries_request(&self, request: reqwest::RequestBuilder) -> Result<Vec<DictionaryInfo>> {
        let response: DictionariesResponse = request
            .send()
            .await
            .context("Dictionary request failed")?
            .error_for_status()?
            .json()
            .await
            .context("Malformed dictionary response")?;
        Ok(response.dictionaries)
    }
}

#[async_trait]
impl TagClient for RemoteTagClient {
    async fn tag(&self, dictionary: &str, text: &str) -> Result<Vec<MatchSpan>> {
        let url = self.endpoint("tag")?;
        debug!(target: TARGET_WEB_REQUEST, "POST {} dict={}", url, dictionary);

        let response: TagResponse = self
            .client
            .post(url)
            .json(&TagRequest {
                doc: text.to_string(),
                dict: dictionary.to_string(),
            })
            .send()
            .await
            .context("Tag request failed")?
            .error_for_status()?
            .json()
            .await
            .context("Malformed tag response")?;

        match response {
            TagResponse {
                error: Some(error), ..
            } => bail!("Tagging with '{}' failed: {}", dictionary, error),
            TagResponse {
                matches: Some(spans),
                ..
            } => Ok(spans),
            _ => bail!("Tag response for '{}' has neither matches nor error", dictionary),
        }
    }

    async fn update_dictionaries(&self) -> Result<Vec<DictionaryInfo>> {
        let url = self.endpoint("dictionaries/update")?;
        debug!(target: TARGET_WEB_REQUEST, "POST {}", url);
        self.dictionaries_request(self.client.post(url)).await
    }

    async fn list_dictionaries(&self) -> Result<Vec<DictionaryInfo>> {
        let url = self.endpoint("dictionaries")?;
        debug!(target: TARGET_WEB_REQUEST, "GET {}", url);
        self.dictionaries_request(self.client.get(url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_keeps_base_path() {
        let client = RemoteTagClient::new("http://localhost:8080/tagservice").unwrap();
        assert_eq!(
            client.endpoint("dictionaries/update").unwrap().as_str(),
            "http://localhost:8080/tagservice/dictionaries/update"
        );

        let client = RemoteTagClient::new("http://localhost:8080").unwrap();
        assert_eq!(client.endpoint("tag").unwrap().as_str(), "http://localhost:8080/tag");
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(RemoteTagClient::new("not a url").is_err());
    }

    #[tokio::test]
    async fn test_local_client_unknown_dictionary() {
        let db = Database::new(":memory:").await.unwrap();
        let client = LocalTagClient::new(Arc::new(TaggerRegistry::new()), db);
        assert!(client.update_dictionaries().await.unwrap().is_empty());
        assert!(client.tag("chembl", "ABC").await.is_err());
    }

    #[tokio::test]
    async fn test_local_client_tags_elements_with_one_tagger() {
        let db = Database::new(":memory:").await.unwrap();
        db.import_entries(
            "chem_dict",
            &[serde_json::json!({"identifier": "X1", "surface_forms": ["ABC"]})],
        )
        .await
        .unwrap();
        db.define_dictionary(
            &crate::tagger::DictionaryDefinition::new("chembl", -1).with_dictionary_source("chem_dict"),
        )
        .await
        .unwrap();

        let registry = Arc::new(TaggerRegistry::new());
        let client = LocalTagClient::new(registry.clone(), db);
        client.update_dictionaries().await.unwrap();

        let tagged = client
            .tag_elements("chembl", &["ABC compound", "nothing", "an ABC"], 2)
            .await
            .unwrap();
        assert_eq!(tagged.spans.len(), 3);
        assert_eq!(tagged.spans[0].len(), 1);
        assert!(tagged.spans[1].is_empty());
        assert_eq!(tagged.spans[2][0].start, 3);
        assert_eq!(tagged.versions, Some(registry.current("chembl").unwrap().versions));

        assert!(client.tag_elements("unknown", &["ABC"], 2).await.is_err());
    }
}
