//! Reconciliation pipeline: cross-reference scan targets against repository state and
//! remove the targets whose repositories are archived.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sweep_adapters::{
    ArchivedStates, DeleteResponse, GithubClient, GithubConfig, HostingPlatform, RepoListing,
    ScanPlatform, SnykClient, SnykConfig, TargetQuery,
};
use sweep_core::{
    Decision, OrgMapping, OrgMappingEntry, QualifiedName, ReconciliationOutcome, RemovalOutcome,
    Target, UnresolvedReason,
};
use sweep_http::{ApiToken, FetchError, HttpClientConfig, HttpFetcher, TokenBucketConfig};
use thiserror::Error;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sweep-reconcile";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateSource {
    #[default]
    Batched,
    Listing,
}

impl FromStr for StateSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "batched" | "batch" => Ok(StateSource::Batched),
            "listing" | "list" => Ok(StateSource::Listing),
            other => bail!("unknown state source {other:?} (expected batched or listing)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub org_mapping_path: PathBuf,
    pub scan_base_url: String,
    pub scan_api_version: String,
    pub hosting_api_url: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub requests_per_minute: Option<u32>,
    pub page_limit: u32,
    pub max_pages: usize,
    pub batch_size: usize,
    pub concurrency: usize,
    pub created_gte: Option<DateTime<Utc>>,
    pub state_source: StateSource,
    pub dry_run: bool,
    pub only_orgs: Vec<String>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            org_mapping_path: PathBuf::from("./org_mapping.json"),
            scan_base_url: "https://api.snyk.io".to_string(),
            scan_api_version: "2024-05-08".to_string(),
            hosting_api_url: "https://api.github.com".to_string(),
            http_timeout_secs: 120,
            user_agent: "sweep/0.1".to_string(),
            requests_per_minute: None,
            page_limit: 100,
            max_pages: sweep_http::DEFAULT_MAX_PAGES,
            batch_size: 50,
            concurrency: 1,
            created_gte: None,
            state_source: StateSource::Batched,
            dry_run: false,
            only_orgs: Vec::new(),
        }
    }
}

impl ReconcileConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset keys keep their defaults,
    /// set-but-invalid keys are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            org_mapping_path: get("SWEEP_ORG_MAPPING")
                .map(PathBuf::from)
                .unwrap_or(defaults.org_mapping_path),
            scan_base_url: get("SWEEP_SNYK_BASE_URL").unwrap_or(defaults.scan_base_url),
            scan_api_version: get("SWEEP_SNYK_API_VERSION").unwrap_or(defaults.scan_api_version),
            hosting_api_url: get("SWEEP_GITHUB_API_URL").unwrap_or(defaults.hosting_api_url),
            http_timeout_secs: parse_var(&get, "SWEEP_HTTP_TIMEOUT_SECS")?
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: get("SWEEP_USER_AGENT").unwrap_or(defaults.user_agent),
            requests_per_minute: parse_var(&get, "SWEEP_REQUESTS_PER_MINUTE")?,
            page_limit: parse_var(&get, "SWEEP_PAGE_LIMIT")?.unwrap_or(defaults.page_limit),
            max_pages: parse_var(&get, "SWEEP_MAX_PAGES")?.unwrap_or(defaults.max_pages),
            batch_size: parse_var(&get, "SWEEP_BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            concurrency: parse_var(&get, "SWEEP_CONCURRENCY")?.unwrap_or(defaults.concurrency),
            created_gte: get("SWEEP_CREATED_GTE")
                .map(|raw| {
                    DateTime::parse_from_rfc3339(raw.trim())
                        .map(|ts| ts.with_timezone(&Utc))
                        .with_context(|| format!("parsing SWEEP_CREATED_GTE={raw:?} as RFC 3339"))
                })
                .transpose()?,
            state_source: parse_var(&get, "SWEEP_STATE_SOURCE")?
                .unwrap_or(defaults.state_source),
            dry_run: get("SWEEP_DRY_RUN")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(defaults.dry_run),
            only_orgs: defaults.only_orgs,
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
            user_agent: Some(self.user_agent.clone()),
            token_bucket: self
                .requests_per_minute
                .filter(|per_minute| *per_minute > 0)
                .map(|per_minute| TokenBucketConfig {
                    capacity: per_minute,
                    refill_every: Duration::from_secs(60) / per_minute,
                }),
        }
    }

    pub fn snyk_config(&self) -> SnykConfig {
        SnykConfig {
            base_url: self.scan_base_url.clone(),
            api_version: self.scan_api_version.clone(),
            page_limit: self.page_limit,
            max_pages: self.max_pages,
        }
    }

    pub fn github_config(&self) -> GithubConfig {
        GithubConfig {
            api_url: self.hosting_api_url.clone(),
            batch_size: self.batch_size,
            max_pages: self.max_pages,
            ..Default::default()
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            dry_run: self.dry_run,
            concurrency: self.concurrency,
            state_source: self.state_source,
            target_query: TargetQuery {
                created_gte: self.created_gte,
            },
            only_orgs: self.only_orgs.clone(),
        }
    }
}

fn parse_var<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|err| anyhow::anyhow!("invalid {key}={raw:?}: {err}"))
        })
        .transpose()
}

/// Reads the organization mapping table; `.yaml`/`.yml` files are YAML, anything else JSON.
pub async fn load_org_mapping(path: &Path) -> Result<OrgMapping> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    );
    let mapping: OrgMapping = if is_yaml {
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
    } else {
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
    };
    info!(path = %path.display(), organizations = mapping.len(), "loaded org mapping");
    Ok(mapping)
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub scan: ApiToken,
    pub hosting: ApiToken,
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let first = |keys: &[&str]| {
            keys.iter()
                .find_map(|key| lookup(key).filter(|v| !v.trim().is_empty()))
                .map(|v| ApiToken::new(v.trim()))
        };
        let Some(scan) = first(&["SNYK_API_KEY", "SNYK_TOKEN"]) else {
            bail!("missing scanning platform credential: set SNYK_API_KEY");
        };
        let Some(hosting) = first(&["GIT_API_KEY", "GITHUB_TOKEN"]) else {
            bail!("missing hosting platform credential: set GIT_API_KEY");
        };
        Ok(Self { scan, hosting })
    }
}

#[derive(Clone)]
pub struct Platforms {
    pub scan: Arc<dyn ScanPlatform>,
    pub hosting: Arc<dyn HostingPlatform>,
}

impl Platforms {
    pub fn connect(config: &ReconcileConfig, credentials: Credentials) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        Ok(Self {
            scan: Arc::new(SnykClient::new(
                Arc::clone(&http),
                credentials.scan,
                config.snyk_config(),
            )),
            hosting: Arc::new(GithubClient::new(
                http,
                credentials.hosting,
                config.github_config(),
            )),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedTarget {
    pub target: Target,
    pub name: QualifiedName,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedTarget {
    pub target: Target,
    pub reason: UnresolvedReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub archived: Vec<MatchedTarget>,
    pub active: Vec<MatchedTarget>,
    pub unresolved: Vec<UnresolvedTarget>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.archived.len() + self.active.len() + self.unresolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct CrossReferenceEngine;

impl CrossReferenceEngine {
    pub fn qualified_names(targets: &[Target]) -> BTreeSet<QualifiedName> {
        targets
            .iter()
            .filter_map(|t| t.qualified_name().ok())
            .collect()
    }

    pub fn partition(targets: Vec<Target>, states: &ArchivedStates) -> Partition {
        let mut partition = Partition::default();
        for target in targets {
            let name = match target.qualified_name() {
                Ok(name) => name,
                Err(err) => {
                    warn!(target_id = %target.id, %err, "unexpected display name format; target left in place");
                    partition.unresolved.push(UnresolvedTarget {
                        target,
                        reason: UnresolvedReason::MalformedName,
                    });
                    continue;
                }
            };

            match states.get(&name) {
                Some(true) => partition.archived.push(MatchedTarget { target, name }),
                Some(false) => partition.active.push(MatchedTarget { target, name }),
                None => {
                    warn!(target_id = %target.id, repo = %name, "repository state unknown; target left in place");
                    partition.unresolved.push(UnresolvedTarget {
                        target,
                        reason: UnresolvedReason::MissingFromState,
                    });
                }
            }
        }
        partition
    }
}

#[derive(Clone)]
pub struct ActionExecutor {
    scan: Arc<dyn ScanPlatform>,
}

impl ActionExecutor {
    pub fn new(scan: Arc<dyn ScanPlatform>) -> Self {
        Self { scan }
    }

    pub async fn remove(&self, scan_org_id: &str, target_id: &str) -> RemovalOutcome {
        info!(scan_org_id, target_id, "removing target");
        let outcome = match self.scan.delete_target(scan_org_id, target_id).await {
            Ok(response) => classify_delete(&response),
            Err(err) => RemovalOutcome::Failed {
                status: None,
                message: err.to_string(),
            },
        };
        match &outcome {
            RemovalOutcome::Removed => info!(scan_org_id, target_id, "target removed"),
            RemovalOutcome::AlreadyAbsent => {
                info!(scan_org_id, target_id, "target already absent")
            }
            RemovalOutcome::Failed { status, message } => {
                warn!(scan_org_id, target_id, ?status, %message, "target removal failed")
            }
        }
        outcome
    }
}

pub fn classify_delete(response: &DeleteResponse) -> RemovalOutcome {
    match response.status {
        200..=299 => RemovalOutcome::Removed,
        404 => RemovalOutcome::AlreadyAbsent,
        status => RemovalOutcome::Failed {
            status: Some(status),
            message: response.body.clone(),
        },
    }
}

#[derive(Debug, Error)]
pub enum OrgError {
    #[error("listing targets failed: {0}")]
    Targets(#[source] FetchError),
    #[error("repository state lookup failed: {0}")]
    RepoState(#[source] FetchError),
    #[error("run cancelled")]
    Cancelled,
}

impl OrgError {
    fn from_fetch(err: FetchError, wrap: fn(FetchError) -> OrgError) -> Self {
        match err {
            FetchError::Cancelled => OrgError::Cancelled,
            other => wrap(other),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub orgs_processed: usize,
    pub orgs_failed: usize,
    pub orgs_cancelled: usize,
    pub targets_seen: usize,
    pub confirmed_archived: usize,
    pub confirmed_active: usize,
    pub unresolved: usize,
    pub removed: usize,
    pub already_absent: usize,
    pub would_remove: usize,
    pub failed: usize,
}

impl RunCounters {
    fn record(&mut self, decision: &Decision) {
        match decision {
            Decision::Removed => self.removed += 1,
            Decision::AlreadyAbsent => self.already_absent += 1,
            Decision::WouldRemove => self.would_remove += 1,
            Decision::SkippedActive => self.confirmed_active += 1,
            Decision::SkippedUnresolved { .. } => self.unresolved += 1,
            Decision::Failed { .. } => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: &RunCounters) {
        self.orgs_processed += other.orgs_processed;
        self.orgs_failed += other.orgs_failed;
        self.orgs_cancelled += other.orgs_cancelled;
        self.targets_seen += other.targets_seen;
        self.confirmed_archived += other.confirmed_archived;
        self.confirmed_active += other.confirmed_active;
        self.unresolved += other.unresolved;
        self.removed += other.removed;
        self.already_absent += other.already_absent;
        self.would_remove += other.would_remove;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum OrgStatus {
    Completed,
    Failed { error: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrgReport {
    pub org: String,
    pub scan_org_id: String,
    pub status: OrgStatus,
    pub counters: RunCounters,
    pub outcomes: Vec<ReconciliationOutcome>,
}

impl OrgReport {
    fn aborted(entry: &OrgMappingEntry, err: OrgError) -> Self {
        let mut counters = RunCounters::default();
        let status = match err {
            OrgError::Cancelled => {
                counters.orgs_cancelled = 1;
                OrgStatus::Cancelled
            }
            other => {
                counters.orgs_failed = 1;
                OrgStatus::Failed {
                    error: other.to_string(),
                }
            }
        };
        Self {
            org: entry.external_org_name.clone(),
            scan_org_id: entry.scan_org_id.clone(),
            status,
            counters,
            outcomes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub counters: RunCounters,
    pub orgs: Vec<OrgReport>,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub concurrency: usize,
    pub state_source: StateSource,
    pub target_query: TargetQuery,
    /// Restrict the run to these mapping names; empty means every entry.
    pub only_orgs: Vec<String>,
}

pub struct ReconciliationDriver {
    mapping: Arc<OrgMapping>,
    options: RunOptions,
    scan: Arc<dyn ScanPlatform>,
    hosting: Arc<dyn HostingPlatform>,
    executor: ActionExecutor,
    cancel: CancellationToken,
}

impl ReconciliationDriver {
    pub fn new(mapping: Arc<OrgMapping>, options: RunOptions, platforms: Platforms) -> Self {
        Self {
            mapping,
            options,
            executor: ActionExecutor::new(Arc::clone(&platforms.scan)),
            scan: platforms.scan,
            hosting: platforms.hosting,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn selected_entries(&self) -> Vec<&OrgMappingEntry> {
        if self.options.only_orgs.is_empty() {
            return self.mapping.entries().iter().collect();
        }
        for name in &self.options.only_orgs {
            if self.mapping.get(name).is_none() {
                warn!(org = %name, "requested organization is not in the mapping");
            }
        }
        self.mapping
            .entries()
            .iter()
            .filter(|e| self.options.only_orgs.contains(&e.external_org_name))
            .collect()
    }

    pub async fn run(&self) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("reconcile_run", %run_id, dry_run = self.options.dry_run);

        async {
            let entries = self.selected_entries();
            info!(organizations = entries.len(), "starting reconciliation");

            let mut reports: Vec<(usize, OrgReport)> = stream::iter(entries.into_iter().enumerate())
                .map(|(index, entry)| async move { (index, self.process_org(entry).await) })
                .buffer_unordered(self.options.concurrency.max(1))
                .collect()
                .await;
            reports.sort_by_key(|(index, _)| *index);

            let mut counters = RunCounters::default();
            let orgs: Vec<OrgReport> = reports.into_iter().map(|(_, report)| report).collect();
            for report in &orgs {
                counters.merge(&report.counters);
            }

            info!(
                targets_seen = counters.targets_seen,
                confirmed_archived = counters.confirmed_archived,
                removed = counters.removed,
                already_absent = counters.already_absent,
                failed = counters.failed,
                orgs_failed = counters.orgs_failed,
                "reconciliation finished"
            );

            RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                dry_run: self.options.dry_run,
                counters,
                orgs,
            }
        }
        .instrument(span)
        .await
    }

    async fn process_org(&self, entry: &OrgMappingEntry) -> OrgReport {
        let span = info_span!(
            "reconcile_org",
            org = %entry.external_org_name,
            scan_org_id = %entry.scan_org_id
        );
        async {
            match self.reconcile_org(entry).await {
                Ok(report) => report,
                Err(OrgError::Cancelled) => {
                    warn!("run cancelled before organization was processed");
                    OrgReport::aborted(entry, OrgError::Cancelled)
                }
                Err(err) => {
                    error!(%err, "organization pass failed; continuing with the next one");
                    OrgReport::aborted(entry, err)
                }
            }
        }
        .instrument(span)
        .await
    }

    pub async fn reconcile_org(&self, entry: &OrgMappingEntry) -> Result<OrgReport, OrgError> {
        if self.cancel.is_cancelled() {
            return Err(OrgError::Cancelled);
        }

        let targets = self
            .scan
            .list_targets(&entry.scan_org_id, &self.options.target_query, &self.cancel)
            .await
            .map_err(|err| OrgError::from_fetch(err, OrgError::Targets))?;
        let names = CrossReferenceEngine::qualified_names(&targets);

        let states = match self.options.state_source {
            StateSource::Batched => {
                self.hosting
                    .batch_check_archived(&names, &self.cancel)
                    .await
            }
            StateSource::Listing => self.states_from_listing(&names).await,
        }
        .map_err(|err| OrgError::from_fetch(err, OrgError::RepoState))?;

        let mut counters = RunCounters {
            orgs_processed: 1,
            targets_seen: targets.len(),
            ..Default::default()
        };
        let partition = CrossReferenceEngine::partition(targets, &states);
        counters.confirmed_archived = partition.archived.len();

        let mut outcomes = Vec::with_capacity(partition.len());
        for matched in partition.active {
            outcomes.push(ReconciliationOutcome {
                target_id: matched.target.id,
                qualified_name: matched.name.to_string(),
                decision: Decision::SkippedActive,
            });
        }
        for unresolved in partition.unresolved {
            outcomes.push(ReconciliationOutcome {
                target_id: unresolved.target.id,
                qualified_name: unresolved.target.display_name,
                decision: Decision::SkippedUnresolved {
                    reason: unresolved.reason,
                },
            });
        }
        for matched in partition.archived {
            info!(repo = %matched.name, target_id = %matched.target.id, "confirmed archived");
            let decision = if self.options.dry_run {
                Decision::WouldRemove
            } else {
                self.executor
                    .remove(&entry.scan_org_id, &matched.target.id)
                    .await
                    .into()
            };
            outcomes.push(ReconciliationOutcome {
                target_id: matched.target.id,
                qualified_name: matched.name.to_string(),
                decision,
            });
        }

        for outcome in &outcomes {
            counters.record(&outcome.decision);
        }

        Ok(OrgReport {
            org: entry.external_org_name.clone(),
            scan_org_id: entry.scan_org_id.clone(),
            status: OrgStatus::Completed,
            counters,
            outcomes,
        })
    }

    // Hosting names compare case-insensitively.
    async fn states_from_listing(
        &self,
        names: &BTreeSet<QualifiedName>,
    ) -> Result<ArchivedStates, FetchError> {
        let owners: BTreeSet<&str> = names.iter().map(|n| n.owner.as_str()).collect();
        let mut listed: HashMap<String, bool> = HashMap::new();
        for owner in owners {
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let repos = self
                .hosting
                .list_repos(owner, RepoListing::IncludeArchived, &self.cancel)
                .await?;
            for repo in repos {
                listed.insert(repo.qualified_name().to_string().to_lowercase(), repo.archived);
            }
        }

        Ok(names
            .iter()
            .filter_map(|name| {
                listed
                    .get(&name.to_string().to_lowercase())
                    .map(|archived| (name.clone(), *archived))
            })
            .collect())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoverageReport {
    pub hosting_org: String,
    pub active_repos: usize,
    pub covered: usize,
    pub uncovered: Vec<QualifiedName>,
    /// Coverage is undercounted while this is non-empty.
    pub failed_orgs: Vec<String>,
}

pub struct CoverageAudit {
    mapping: Arc<OrgMapping>,
    target_query: TargetQuery,
    scan: Arc<dyn ScanPlatform>,
    hosting: Arc<dyn HostingPlatform>,
    cancel: CancellationToken,
}

impl CoverageAudit {
    pub fn new(mapping: Arc<OrgMapping>, target_query: TargetQuery, platforms: Platforms) -> Self {
        Self {
            mapping,
            target_query,
            scan: platforms.scan,
            hosting: platforms.hosting,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(&self, hosting_org: &str) -> Result<CoverageReport, FetchError> {
        let repos = self
            .hosting
            .list_repos(hosting_org, RepoListing::ActiveOnly, &self.cancel)
            .await?;

        let mut tracked: BTreeMap<String, usize> = BTreeMap::new();
        let mut failed_orgs = Vec::new();
        for entry in self.mapping.entries() {
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            match self
                .scan
                .list_targets(&entry.scan_org_id, &self.target_query, &self.cancel)
                .await
            {
                Ok(targets) => {
                    for name in CrossReferenceEngine::qualified_names(&targets) {
                        *tracked.entry(name.to_string().to_lowercase()).or_default() += 1;
                    }
                }
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(err) => {
                    warn!(org = %entry.external_org_name, %err, "could not list targets for coverage");
                    failed_orgs.push(entry.external_org_name.clone());
                }
            }
        }

        let mut uncovered = Vec::new();
        for repo in &repos {
            let name = repo.qualified_name();
            if !tracked.contains_key(&name.to_string().to_lowercase()) {
                info!(repo = %name, "active repository has no scan target");
                uncovered.push(name);
            }
        }

        Ok(CoverageReport {
            hosting_org: hosting_org.to_string(),
            active_repos: repos.len(),
            covered: repos.len() - uncovered.len(),
            uncovered,
            failed_orgs,
        })
    }
}
