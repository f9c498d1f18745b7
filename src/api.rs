use anyhow::{Context, Result};
use axum::{
    extract::{Json, State},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::error::TagError;
use crate::matcher::MatchSpan;
use crate::tagger::{DictionaryInfo, MatchService, TaggerRegistry};
use crate::TARGET_WEB_REQUEST;

/// Body of `POST /tag`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagRequest {
    pub doc: String,
    pub dict: String,
}

/// Either `{"match": [...]}` or `{"error": "..."}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagResponse {
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub matches: Option<Vec<MatchSpan>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DictionariesResponse {
    pub dictionaries: Vec<DictionaryInfo>,
}

#[derive(Clone)]
pub struct AppState {
    pub service: MatchService,
    pub db: Database,
}

impl AppState {
    pub fn new(registry: Arc<TaggerRegistry>, db: Database) -> Self {
        AppState {
            service: MatchService::new(registry),
            db,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tag", post(tag))
        .route("/dictionaries", get(list_dictionaries))
        .route("/dictionaries/update", post(update_dictionaries))
        .with_state(state)
}

/// Serves the API on `listener` until the process exits.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let addr = listener.local_addr().context("Listener has no local address")?;
    info!(target: TARGET_WEB_REQUEST, "Tag service running on http://{}", addr);

    axum::serve(listener, router(state).into_make_service())
        .await
        .context("API server failed")
}

/// Binds `0.0.0.0:port` and serves the API.
pub async fn api_loop(port: u16, state: AppState) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    serve(listener, state).await
}

async fn tag(State(state): State<AppState>, Json(payload): Json<TagRequest>) -> Json<TagResponse> {
    debug!(target: TARGET_WEB_REQUEST, "POST /tag dict={} ({} bytes)", payload.dict, payload.doc.len());

    match state.service.tag(&payload.dict, &payload.doc) {
        Ok(spans) => Json(TagResponse {
            matches: Some(spans),
            error: None,
        }),
        Err(TagError::NotFound(name)) => {
            warn!(target: TARGET_WEB_REQUEST, "Tag request for unknown dictionary '{}'", name);
            Json(TagResponse {
                matches: None,
                error: Some("Unknown dictionary.".to_string()),
            })
        }
        Err(err) => {
            error!(target: TARGET_WEB_REQUEST, "Tag request failed: {}", err);
            Json(TagResponse {
                matches: None,
                error: Some(err.to_string()),
            })
        }
    }
}

async fn list_dictionaries(State(state): State<AppState>) -> Json<DictionariesResponse> {
    Json(DictionariesResponse {
        dictionaries: state.service.registry().dictionaries(),
    })
}

async fn update_dictionaries(State(state): State<AppState>) -> Json<DictionariesResponse> {
    info!(target: TARGET_WEB_REQUEST, "POST /dictionaries/update");

    match state.service.registry().reload(&state.db).await {
        Ok(report) if !report.failed.is_empty() => {
            warn!(target: TARGET_WEB_REQUEST, "{} dictionaries failed to rebuild", report.failed.len());
        }
        Ok(_) => {}
        Err(err) => {
            error!(target: TARGET_WEB_REQUEST, "Failed to read dictionary definitions: {}", err);
        }
    }

    Json(DictionariesResponse {
        dictionaries: state.service.registry().dictionaries(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::Binding;
    use crate::retag::client::{RemoteTagClient, TagClient};
    use crate::tagger::{parse_version, DictionaryDefinition};
    use serde_json::json;

    async fn spawn_service() -> (RemoteTagClient, Database) {
        let db = Database::new(":memory:").await.unwrap();
        db.import_entries(
            "chem_dict",
            &[json!({"identifier": "X1", "surface_forms": ["ABC"]})],
        )
        .await
        .unwrap();
        db.define_dictionary(&DictionaryDefinition::new("chembl", -1).with_dictionary_source("chem_dict"))
            .await
            .unwrap();

        let registry = Arc::new(TaggerRegistry::new());
        let state = AppState::new(registry, db.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, state));

        let client = RemoteTagClient::new(&format!("http://{}", addr)).unwrap();
        (client, db)
    }

    #[test]
    fn test_tag_response_shapes() {
        let ok = TagResponse {
            matches: Some(vec![MatchSpan {
                start: 0,
                end: 2,
                bindings: vec![Binding::new(-1, "X1")],
            }]),
            error: None,
        };
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"match": [[0, 2, [[-1, "X1"]]]]})
        );

        let unknown = TagResponse {
            matches: None,
            error: Some("Unknown dictionary.".to_string()),
        };
        assert_eq!(
            serde_json::to_value(&unknown).unwrap(),
            json!({"error": "Unknown dictionary."})
        );
    }

    #[tokio::test]
    async fn test_api_end_to_end() {
        let (client, db) = spawn_service().await;

        // Nothing is built before the first update
        assert!(client.list_dictionaries().await.unwrap().is_empty());
        let err = client.tag("chembl", "ABC compound").await.unwrap_err();
        assert!(err.to_string().contains("Unknown dictionary."));

        let dictionaries = client.update_dictionaries().await.unwrap();
        assert_eq!(dictionaries.len(), 1);
        assert_eq!(dictionaries[0].name, "chembl");
        assert_eq!(dictionaries[0].entity_types, vec![-1]);
        assert_eq!(dictionaries[0].blacklist, "2020-01-01T00:00:00.000000Z");

        let spans = client.tag("chembl", "ABC compound").await.unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!((spans[0].start, spans[0].end), (0, 2));
        assert_eq!(spans[0].bindings, vec![Binding::new(-1, "X1")]);

        // A new blacklist is picked up by the next update
        let version = parse_version("2024-03-03T00:00:00Z").unwrap();
        db.add_blacklist_snapshot("chem_black", &["ABC".to_string()], version)
            .await
            .unwrap();
        db.define_dictionary(
            &DictionaryDefinition::new("chembl", -1)
                .with_dictionary_source("chem_dict")
                .with_blacklist_source("chem_black"),
        )
        .await
        .unwrap();
        let dictionaries = client.update_dictionaries().await.unwrap();
        assert_eq!(dictionaries[0].versions().unwrap().blacklist, version);
        assert!(client.tag("chembl", "ABC compound").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_dictionary_is_http_200() {
        let (client, _db) = spawn_service().await;
        let response = reqwest::Client::new()
            .post(client.endpoint("tag").unwrap())
            .json(&TagRequest {
                doc: "ABC".to_string(),
                dict: "pubchem".to_string(),
            })
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: TagResponse = response.json().await.unwrap();
        assert_eq!(body.error.as_deref(), Some("Unknown dictionary."));
        assert!(body.matches.is_none());
    }
}
