//! Platform contracts + the Snyk (scanning) and GitHub (hosting) clients behind them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use sweep_core::{QualifiedName, Repo, Target};
use sweep_http::{
    ApiToken, Authorization, FetchError, HttpFetcher, Page, PageRequest, PageSource,
    PagedInventoryFetcher, Pagination, DEFAULT_MAX_PAGES,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "sweep-adapters";

/// Archived flag per queried repository. Names missing from the map are unknown.
pub type ArchivedStates = BTreeMap<QualifiedName, bool>;

/// Fixed filters applied to every target listing of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetQuery {
    pub created_gte: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoListing {
    /// Active inventory: archived repositories are dropped.
    ActiveOnly,
    /// State lookup: every repository is kept with its archived flag.
    IncludeArchived,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteResponse {
    pub status: u16,
    pub body: String,
}

#[async_trait]
pub trait ScanPlatform: Send + Sync {
    async fn list_targets(
        &self,
        scan_org_id: &str,
        query: &TargetQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<Target>, FetchError>;

    async fn delete_target(
        &self,
        scan_org_id: &str,
        target_id: &str,
    ) -> Result<DeleteResponse, FetchError>;
}

#[async_trait]
pub trait HostingPlatform: Send + Sync {
    async fn list_repos(
        &self,
        hosting_org: &str,
        listing: RepoListing,
        cancel: &CancellationToken,
    ) -> Result<Vec<Repo>, FetchError>;

    async fn batch_check_archived(
        &self,
        names: &BTreeSet<QualifiedName>,
        cancel: &CancellationToken,
    ) -> Result<ArchivedStates, FetchError>;
}

#[derive(Debug, Clone)]
pub struct SnykConfig {
    pub base_url: String,
    pub api_version: String,
    pub page_limit: u32,
    pub max_pages: usize,
}

impl Default for SnykConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.snyk.io".to_string(),
            api_version: "2024-05-08".to_string(),
            page_limit: 100,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

#[derive(Debug)]
pub struct SnykClient {
    http: Arc<HttpFetcher>,
    auth: Authorization,
    config: SnykConfig,
}

impl SnykClient {
    pub fn new(http: Arc<HttpFetcher>, token: ApiToken, config: SnykConfig) -> Self {
        Self {
            http,
            auth: Authorization::Token(token),
            config,
        }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    /// Snyk hands back `links.next` relative to the API host.
    fn resolve_link(&self, link: &str) -> String {
        if link.starts_with("http://") || link.starts_with("https://") {
            link.to_string()
        } else {
            format!("{}{}", self.base_url(), link)
        }
    }
}

#[derive(Debug, Deserialize)]
struct SnykTargetsPage {
    #[serde(default)]
    data: Vec<JsonValue>,
    #[serde(default)]
    links: Option<SnykLinks>,
}

#[derive(Debug, Deserialize)]
struct SnykLinks {
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnykTargetRecord {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    attributes: Option<SnykTargetAttributes>,
}

#[derive(Debug, Deserialize)]
struct SnykTargetAttributes {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
}

struct SnykTargetPages<'a> {
    client: &'a SnykClient,
    scan_org_id: &'a str,
    query: &'a TargetQuery,
}

impl SnykTargetPages<'_> {
    fn first_request(&self) -> (String, Vec<(&'static str, String)>) {
        let url = format!(
            "{}/rest/orgs/{}/targets",
            self.client.base_url(),
            self.scan_org_id
        );
        let mut params = vec![
            ("version", self.client.config.api_version.clone()),
            ("limit", self.client.config.page_limit.to_string()),
            ("exclude_empty", "false".to_string()),
        ];
        if let Some(floor) = self.query.created_gte {
            params.push((
                "created_gte",
                floor.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }
        (url, params)
    }

    fn to_target(&self, raw: JsonValue) -> Option<Target> {
        let record: SnykTargetRecord = match serde_json::from_value(raw) {
            Ok(record) => record,
            Err(err) => {
                warn!(scan_org_id = self.scan_org_id, %err, "skipping undecodable target record");
                return None;
            }
        };
        let attributes = record.attributes;
        let display_name = attributes
            .as_ref()
            .and_then(|a| a.display_name.clone())
            .unwrap_or_default();
        let Some(id) = record.id.filter(|id| !id.is_empty()) else {
            warn!(
                scan_org_id = self.scan_org_id,
                %display_name, "skipping target record without an id"
            );
            return None;
        };
        let created_at = attributes
            .and_then(|a| a.created_at)
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|ts| ts.with_timezone(&Utc));

        Some(Target {
            id,
            display_name,
            scan_org_id: self.scan_org_id.to_string(),
            created_at,
        })
    }
}

#[async_trait]
impl<'a> PageSource for SnykTargetPages<'a> {
    type Record = Target;

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page<Target>, FetchError> {
        let (url, params) = match request {
            PageRequest::Link(link) => (self.client.resolve_link(link), Vec::new()),
            PageRequest::First | PageRequest::Number(_) => self.first_request(),
        };

        let page: SnykTargetsPage = match self
            .client
            .http
            .get_json(&url, &self.client.auth, &params)
            .await
        {
            Ok(page) => page,
            Err(FetchError::Shape { url, reason }) => {
                warn!(%url, %reason, "malformed targets page; treating it as the end of the inventory");
                return Ok(Page::end());
            }
            Err(err) => return Err(err),
        };

        let records = page
            .data
            .into_iter()
            .filter_map(|raw| self.to_target(raw))
            .collect();
        let next = page.links.and_then(|links| links.next).filter(|n| !n.is_empty());
        Ok(Page::new(records, next))
    }
}

#[async_trait]
impl ScanPlatform for SnykClient {
    async fn list_targets(
        &self,
        scan_org_id: &str,
        query: &TargetQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<Target>, FetchError> {
        info!(scan_org_id, "fetching all targets");
        let pages = SnykTargetPages {
            client: self,
            scan_org_id,
            query,
        };
        let targets = PagedInventoryFetcher::new(pages, Pagination::CursorLink)
            .with_max_pages(self.config.max_pages)
            .with_cancellation(cancel.clone())
            .collect_all()
            .await?;
        info!(scan_org_id, total = targets.len(), "fetched targets");
        Ok(targets)
    }

    async fn delete_target(
        &self,
        scan_org_id: &str,
        target_id: &str,
    ) -> Result<DeleteResponse, FetchError> {
        let url = format!(
            "{}/rest/orgs/{}/targets/{}",
            self.base_url(),
            scan_org_id,
            target_id
        );
        let response = self
            .http
            .delete(
                &url,
                &self.auth,
                &[("version", self.config.api_version.clone())],
            )
            .await?;
        Ok(DeleteResponse {
            status: response.status.as_u16(),
            body: response.body_text(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct GithubConfig {
    pub api_url: String,
    pub per_page: u32,
    pub batch_size: usize,
    pub max_pages: usize,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            per_page: 100,
            batch_size: 50,
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

impl GithubConfig {
    /// GraphQL endpoint next to the REST root; Enterprise Server serves it from `/api/graphql`.
    pub fn graphql_url(&self) -> String {
        let api = self.api_url.trim_end_matches('/');
        match api.strip_suffix("/api/v3") {
            Some(host) => format!("{host}/api/graphql"),
            None => format!("{api}/graphql"),
        }
    }
}

#[derive(Debug)]
pub struct GithubClient {
    http: Arc<HttpFetcher>,
    auth: Authorization,
    config: GithubConfig,
}

impl GithubClient {
    pub fn new(http: Arc<HttpFetcher>, token: ApiToken, config: GithubConfig) -> Self {
        Self {
            http,
            auth: Authorization::Bearer(token),
            config,
        }
    }

    async fn query_chunk(
        &self,
        chunk: &[&QualifiedName],
        states: &mut ArchivedStates,
    ) -> Result<(), FetchError> {
        let request = archived_state_query(chunk);
        let response: GraphqlResponse = match self
            .http
            .post_json(&self.config.graphql_url(), &self.auth, &request)
            .await
        {
            Ok(response) => response,
            Err(FetchError::Shape { url, reason }) => {
                warn!(%url, %reason, names = chunk.len(), "malformed state response; names stay unknown");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        for error in response.errors.iter().flatten() {
            debug!(message = %error.message, "state query reported an error");
        }
        let Some(data) = response.data else {
            warn!(names = chunk.len(), "state query returned no data; names stay unknown");
            return Ok(());
        };

        for (index, name) in chunk.iter().enumerate() {
            let node = data.get(&format!("r{index}")).and_then(Option::as_ref);
            match node.and_then(|n| n.is_archived.map(|archived| (n, archived))) {
                Some((node, archived)) => {
                    if let Some(canonical) = &node.name_with_owner {
                        if !canonical.eq_ignore_ascii_case(&name.to_string()) {
                            debug!(requested = %name, %canonical, "repository answered under another name");
                        }
                    }
                    states.insert((*name).clone(), archived);
                }
                None => debug!(repo = %name, "repository absent from state response"),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct GithubRepoRecord {
    name: String,
    #[serde(default)]
    owner: Option<GithubOwner>,
    #[serde(default)]
    archived: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct GithubOwner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<HashMap<String, Option<GraphqlRepoNode>>>,
    #[serde(default)]
    errors: Option<Vec<GraphqlError>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphqlRepoNode {
    #[serde(default)]
    name_with_owner: Option<String>,
    #[serde(default)]
    is_archived: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    #[serde(default)]
    message: String,
}

/// One aliased `repository` lookup per name, passed as variables rather than spliced in.
fn archived_state_query(chunk: &[&QualifiedName]) -> JsonValue {
    let mut declarations = Vec::with_capacity(chunk.len() * 2);
    let mut fields = Vec::with_capacity(chunk.len());
    let mut variables = Map::new();
    for (index, name) in chunk.iter().enumerate() {
        declarations.push(format!("$o{index}: String!, $n{index}: String!"));
        fields.push(format!(
            "r{index}: repository(owner: $o{index}, name: $n{index}) {{ nameWithOwner isArchived }}"
        ));
        variables.insert(format!("o{index}"), JsonValue::String(name.owner.clone()));
        variables.insert(format!("n{index}"), JsonValue::String(name.name.clone()));
    }
    json!({
        "query": format!("query({}) {{ {} }}", declarations.join(", "), fields.join(" ")),
        "variables": variables,
    })
}

struct GithubRepoPages<'a> {
    client: &'a GithubClient,
    hosting_org: &'a str,
}

#[async_trait]
impl<'a> PageSource for GithubRepoPages<'a> {
    type Record = Repo;

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page<Repo>, FetchError> {
        let page_no = match request {
            PageRequest::Number(n) => *n,
            PageRequest::First | PageRequest::Link(_) => 1,
        };
        let url = format!(
            "{}/orgs/{}/repos",
            self.client.config.api_url.trim_end_matches('/'),
            self.hosting_org
        );
        let params = [
            ("type", "all".to_string()),
            ("per_page", self.client.config.per_page.to_string()),
            ("page", page_no.to_string()),
        ];

        let raw: Vec<JsonValue> = match self
            .client
            .http
            .get_json(&url, &self.client.auth, &params)
            .await
        {
            Ok(raw) => raw,
            Err(FetchError::Shape { url, reason }) => {
                warn!(%url, %reason, page = page_no, "malformed repository page; treating it as the end of the inventory");
                return Ok(Page::end());
            }
            Err(err) => return Err(err),
        };

        let repos: Vec<Repo> = raw
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<GithubRepoRecord>(value) {
                Ok(GithubRepoRecord {
                    name,
                    owner,
                    archived: Some(archived),
                }) => Some(Repo {
                    owner: owner
                        .map(|o| o.login)
                        .unwrap_or_else(|| self.hosting_org.to_string()),
                    name,
                    archived,
                }),
                Ok(record) => {
                    warn!(repo = %record.name, "skipping repository without an archived flag");
                    None
                }
                Err(err) => {
                    warn!(%err, "skipping undecodable repository record");
                    None
                }
            })
            .collect();
        Ok(Page::new(repos, None))
    }
}

#[async_trait]
impl HostingPlatform for GithubClient {
    async fn list_repos(
        &self,
        hosting_org: &str,
        listing: RepoListing,
        cancel: &CancellationToken,
    ) -> Result<Vec<Repo>, FetchError> {
        let pages = GithubRepoPages {
            client: self,
            hosting_org,
        };
        let mut repos = PagedInventoryFetcher::new(pages, Pagination::PageNumber)
            .with_max_pages(self.config.max_pages)
            .with_cancellation(cancel.clone())
            .collect_all()
            .await?;
        let total = repos.len();
        if listing == RepoListing::ActiveOnly {
            repos.retain(|repo| !repo.archived);
        }
        info!(hosting_org, total, kept = repos.len(), ?listing, "fetched repositories");
        Ok(repos)
    }

    async fn batch_check_archived(
        &self,
        names: &BTreeSet<QualifiedName>,
        cancel: &CancellationToken,
    ) -> Result<ArchivedStates, FetchError> {
        let names: Vec<&QualifiedName> = names.iter().collect();
        let mut states = ArchivedStates::new();
        for chunk in names.chunks(self.config.batch_size.max(1)) {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            debug!(names = chunk.len(), "executing batched state query");
            self.query_chunk(chunk, &mut states).await?;
        }
        info!(
            queried = names.len(),
            known = states.len(),
            archived = states.values().filter(|archived| **archived).count(),
            "batched state query finished"
        );
        Ok(states)
    }
}
