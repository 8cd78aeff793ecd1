use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::FetchError;

/// Reserved sentinel id for the virtual "Unsorted" collection. The provider
/// serves its items under this id but never lists it as a real collection,
/// so the fetcher synthesizes a node for it.
pub const UNSORTED_COLLECTION_ID: i64 = -1;

/// Item page size. A page shorter than this means the collection is
/// exhausted.
pub const ITEMS_PER_PAGE: usize = 50;

/// A remote collection.
#[derive(Debug, Clone)]
pub struct RemoteNode {
    pub id: i64,
    pub title: String,
    /// None means the collection sits at the top level (directly under the
    /// mirror root once pulled).
    pub parent_id: Option<i64>,
    pub cover: Option<String>,
    pub sort_index: i64,
}

/// A remote bookmark entry. Belongs to exactly one collection.
#[derive(Debug, Clone)]
pub struct RemoteItem {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub collection_id: i64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Normalized snapshot of the remote hierarchy: every collection keyed by
/// id plus the ordered item list of each collection.
#[derive(Debug, Default)]
pub struct RemoteForest {
    pub nodes: HashMap<i64, RemoteNode>,
    pub items: HashMap<i64, Vec<RemoteItem>>,
}

impl RemoteForest {
    /// Children of `parent` ordered by sort index. `None` returns the
    /// top-level collections, including any whose parent id points at a
    /// collection missing from the fetch.
    pub fn children_of(&self, parent: Option<i64>) -> Vec<&RemoteNode> {
        let mut children: Vec<&RemoteNode> = self
            .nodes
            .values()
            .filter(|n| match (parent, n.parent_id) {
                (Some(p), Some(np)) => np == p,
                (None, None) => true,
                (None, Some(np)) => !self.nodes.contains_key(&np),
                (Some(_), None) => false,
            })
            .collect();
        children.sort_by_key(|n| (n.sort_index, n.id));
        children
    }

    pub fn item_count(&self) -> usize {
        self.items.values().map(Vec::len).sum()
    }
}

/// Source of the remote snapshot. The reconciler never runs on a partial
/// fetch: implementations must fail the whole call on any error.
#[allow(async_fn_in_trait)]
pub trait RemoteSource: Send {
    async fn fetch_remote_tree(&self) -> Result<RemoteForest, FetchError>;
}

// Wire shapes of the cloud bookmark API.

#[derive(Debug, Deserialize)]
struct ApiList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ParentRef {
    #[serde(rename = "$id")]
    id: i64,
}

#[derive(Debug, Deserialize)]
struct ApiCollection {
    #[serde(rename = "_id")]
    id: i64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    parent: Option<ParentRef>,
    #[serde(default)]
    cover: Vec<String>,
    #[serde(default)]
    sort: i64,
}

#[derive(Debug, Deserialize)]
struct ApiItem {
    #[serde(rename = "_id")]
    id: i64,
    #[serde(default)]
    title: String,
    link: String,
    collection: ParentRef,
    #[serde(rename = "lastUpdate")]
    last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiUserEnvelope {
    user: ApiUser,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    #[serde(rename = "_id")]
    id: i64,
    #[serde(default)]
    email: Option<String>,
}

impl From<ApiCollection> for RemoteNode {
    fn from(c: ApiCollection) -> Self {
        RemoteNode {
            id: c.id,
            title: c.title,
            parent_id: c.parent.map(|p| p.id),
            cover: c.cover.into_iter().next(),
            sort_index: c.sort,
        }
    }
}

impl From<ApiItem> for RemoteItem {
    fn from(i: ApiItem) -> Self {
        RemoteItem {
            id: i.id,
            title: i.title,
            url: i.link,
            collection_id: i.collection.id,
            last_modified: i.last_update,
        }
    }
}

/// HTTP client for the remote bookmark service. Bearer-token REST, JSON
/// payloads, paginated item listing per collection.
pub struct RemoteApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl RemoteApiClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, FetchError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                endpoint: path.to_string(),
                status: response.status().as_u16(),
            });
        }

        response.json::<T>().await.map_err(|e| FetchError::Decode {
            endpoint: path.to_string(),
            message: e.to_string(),
        })
    }

    async fn fetch_user(&self) -> Result<ApiUser, FetchError> {
        let envelope: ApiUserEnvelope = self.get_json("/user").await?;
        Ok(envelope.user)
    }

    /// Top-level and nested collections merged into one set keyed by id.
    async fn fetch_collections(&self) -> Result<HashMap<i64, RemoteNode>, FetchError> {
        let top: ApiList<ApiCollection> = self.get_json("/collections").await?;
        let nested: ApiList<ApiCollection> = self.get_json("/collections/childrens").await?;

        let mut nodes = HashMap::new();
        for collection in top.items.into_iter().chain(nested.items) {
            let node: RemoteNode = collection.into();
            let id = node.id;
            if nodes.insert(id, node).is_some() {
                warn!("⚠️  Remote returned collection {} twice, keeping the later copy", id);
            }
        }
        Ok(nodes)
    }

    /// All items of one collection, page by page, until a short or empty
    /// page signals exhaustion.
    async fn fetch_items(&self, collection_id: i64) -> Result<Vec<RemoteItem>, FetchError> {
        let mut items = Vec::new();
        let mut page = 0usize;

        loop {
            let path = format!(
                "/raindrops/{}?perpage={}&page={}",
                collection_id, ITEMS_PER_PAGE, page
            );
            let response: ApiList<ApiItem> = self.get_json(&path).await?;
            let count = response.items.len();
            items.extend(response.items.into_iter().map(RemoteItem::from));

            if count < ITEMS_PER_PAGE {
                break;
            }
            page += 1;
        }

        debug!("Fetched {} items for collection {}", items.len(), collection_id);
        Ok(items)
    }
}

impl RemoteSource for RemoteApiClient {
    async fn fetch_remote_tree(&self) -> Result<RemoteForest, FetchError> {
        let user = self.fetch_user().await?;
        info!(
            "👤 Authenticated as remote user {} ({})",
            user.id,
            user.email.as_deref().unwrap_or("no email")
        );

        let mut nodes = self.fetch_collections().await?;
        info!("📚 Fetched {} collections", nodes.len());

        // The virtual "Unsorted" collection: anchored directly under the
        // mirror root, never under a real collection.
        nodes.insert(
            UNSORTED_COLLECTION_ID,
            RemoteNode {
                id: UNSORTED_COLLECTION_ID,
                title: "Unsorted".to_string(),
                parent_id: None,
                cover: None,
                sort_index: i64::MAX,
            },
        );

        // Spinner rather than a bar: pagination has no known total up front
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap(),
        );

        let mut items = HashMap::new();
        for &collection_id in nodes.keys() {
            spinner.set_message(format!("Fetching bookmarks (collection {})...", collection_id));
            match self.fetch_items(collection_id).await {
                Ok(list) => {
                    items.insert(collection_id, list);
                }
                Err(e) => {
                    spinner.finish_with_message("❌ Remote fetch failed");
                    return Err(e);
                }
            }
        }

        let forest = RemoteForest { nodes, items };
        spinner.finish_with_message(format!(
            "✅ Fetched {} bookmarks across {} collections",
            forest.item_count(),
            forest.nodes.len()
        ));
        Ok(forest)
    }
}
