//! Resolved community configuration.
//!
//! A [`ResolvedConfig`] is built once per load by layering a community's
//! document over the global defaults: Global → Community. Consumers never
//! merge on access.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::defaults::GlobalDefaults;
use super::document::CommunityDocument;
use super::source::content_hash;
use crate::domain::PollSource;
use crate::poller::RetryConfig;
use crate::rules::{Run, resolve_target};
use crate::{Error, Result};

/// Fully resolved configuration for one community.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub community: String,
    pub sources: Vec<PollSource>,
    #[serde(skip)]
    pub runs: Arc<Vec<Run>>,
    pub queue_concurrency: usize,
    pub max_goto_depth: u32,
    pub dry_run: bool,
    pub retry: RetryConfig,
    /// SHA-256 of the raw document.
    pub hash: String,
    /// Non-fatal problems found during validation.
    pub warnings: Vec<String>,
}

impl ResolvedConfig {
    pub fn builder() -> ResolvedConfigBuilder {
        ResolvedConfigBuilder::default()
    }

    /// Parse a raw document and resolve it against `global`.
    pub fn from_raw(global: &GlobalDefaults, community: &str, raw: &str) -> Result<Self> {
        let document = CommunityDocument::parse(raw)?;
        Self::builder()
            .with_global(global)
            .with_community(community, document, content_hash(raw))
            .build()
    }

    /// Whether event polling can be started with this configuration.
    pub fn has_sources(&self) -> bool {
        !self.sources.is_empty()
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }
}

#[derive(Debug, Default)]
pub struct ResolvedConfigBuilder {
    poll_limit: Option<usize>,
    poll_interval_secs: Option<u64>,
    queue_concurrency: Option<usize>,
    max_goto_depth: Option<u32>,
    dry_run: Option<bool>,
    retry: Option<RetryConfig>,
    community: Option<String>,
    document: Option<CommunityDocument>,
    hash: Option<String>,
}

impl ResolvedConfigBuilder {
    /// Apply global defaults as the base layer.
    pub fn with_global(mut self, global: &GlobalDefaults) -> Self {
        debug!(
            "[Layer 1: Global] Setting base config: concurrency={}, poll_limit={}, poll_interval={}s, max_goto_depth={}, dry_run={}",
            global.queue_concurrency,
            global.poll_limit,
            global.poll_interval_secs,
            global.max_goto_depth,
            global.dry_run
        );
        self.poll_limit = Some(global.poll_limit);
        self.poll_interval_secs = Some(global.poll_interval_secs);
        self.queue_concurrency = Some(global.queue_concurrency);
        self.max_goto_depth = Some(global.max_goto_depth);
        self.dry_run = Some(global.dry_run);
        self.retry = Some(global.retry.clone());
        self
    }

    /// Apply a community document over the base layer.
    pub fn with_community(
        mut self,
        community: impl Into<String>,
        document: CommunityDocument,
        hash: impl Into<String>,
    ) -> Self {
        let community = community.into();
        let concurrency = document.queue.as_ref().and_then(|q| q.concurrency);
        debug!(
            "[Layer 2: Community] Applying overrides for {}: sources={}, runs={}, concurrency={:?}, max_goto_depth={:?}, dry_run={:?}",
            community,
            document.polling.len(),
            document.runs.len(),
            concurrency,
            document.max_goto_depth,
            document.dry_run
        );
        if let Some(v) = concurrency {
            self.queue_concurrency = Some(v);
        }
        if let Some(v) = document.max_goto_depth {
            self.max_goto_depth = Some(v);
        }
        if let Some(v) = document.dry_run {
            self.dry_run = Some(v);
        }
        self.community = Some(community);
        self.document = Some(document);
        self.hash = Some(hash.into());
        self
    }

    /// Resolve and validate.
    pub fn build(self) -> Result<ResolvedConfig> {
        let community = self
            .community
            .ok_or_else(|| Error::config("no community layer applied"))?;
        let document = self.document.unwrap_or_default();
        let limit = self.poll_limit.unwrap_or(super::defaults::DEFAULT_POLL_LIMIT);
        let interval = self
            .poll_interval_secs
            .unwrap_or(super::defaults::DEFAULT_POLL_INTERVAL_SECS);

        let mut warnings = Vec::new();
        let mut source_names = HashSet::new();
        let mut sources = Vec::with_capacity(document.polling.len());
        for entry in document.polling {
            let def = entry.into_definition();
            let mut source = PollSource::new(
                def.kind,
                def.limit.unwrap_or(limit),
                Duration::from_secs(def.interval.unwrap_or(interval)),
            )
            .with_continuity(def.enforce_continuity);
            if let Some(name) = def.name {
                source = source.with_name(name);
            }
            if let Some(secs) = def.delay_until.filter(|secs| *secs > 0) {
                source = source.with_delay_until(Duration::from_secs(secs));
            }
            if source.limit == 0 {
                return Err(Error::config(format!(
                    "polling source '{}' has a page limit of 0",
                    source.name
                )));
            }
            if !source_names.insert(source.name.clone()) {
                return Err(Error::config(format!(
                    "duplicate polling source '{}'",
                    source.name
                )));
            }
            sources.push(source);
        }
        if sources.is_empty() {
            warnings.push("no polling sources configured; events cannot be started".to_string());
        }

        validate_runs(&document.runs)?;

        let queue_concurrency = self.queue_concurrency.unwrap_or(1);
        if queue_concurrency == 0 {
            return Err(Error::config("queue concurrency must be at least 1"));
        }

        for warning in &warnings {
            warn!(community = %community, "{}", warning);
        }

        Ok(ResolvedConfig {
            community,
            sources,
            runs: Arc::new(document.runs),
            queue_concurrency,
            max_goto_depth: self
                .max_goto_depth
                .unwrap_or(crate::rules::DEFAULT_MAX_GOTO_DEPTH),
            dry_run: self.dry_run.unwrap_or(false),
            retry: self.retry.unwrap_or_default(),
            hash: self.hash.unwrap_or_default(),
            warnings,
        })
    }
}

fn validate_runs(runs: &[Run]) -> Result<()> {
    let mut run_names = HashSet::new();
    for run in runs {
        if run.name.trim().is_empty() {
            return Err(Error::config("run names must not be empty"));
        }
        if !run_names.insert(run.name.as_str()) {
            return Err(Error::config(format!("duplicate run name '{}'", run.name)));
        }

        let mut check_names = HashSet::new();
        for check in &run.checks {
            if check.name.trim().is_empty() {
                return Err(Error::config(format!(
                    "run '{}' has a check without a name",
                    run.name
                )));
            }
            if !check_names.insert(check.name.as_str()) {
                return Err(Error::config(format!(
                    "duplicate check name '{}' in run '{}'",
                    check.name, run.name
                )));
            }
        }
    }

    for run in runs {
        for target in run.goto_targets() {
            if resolve_target(runs, target).is_none() {
                return Err(Error::config(format!(
                    "run '{}' jumps to unknown target '{}'",
                    run.name, target
                )));
            }
        }
    }
    Ok(())
}
