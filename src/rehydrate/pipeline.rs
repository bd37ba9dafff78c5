//! Rehydration pipeline
//!
//! `rehydrate(query) → ContextBundle` in seven stages: intent
//! classification, candidate retrieval, hybrid ranking, policy filtering,
//! token-budgeted selection, grouped summarization, and bundle assembly.
//! The request deadline is surfaced to every suspending sub-call; group
//! summaries run concurrently and a deadline that expires mid-summarization
//! yields a partial bundle when at least one group finished. Side effects
//! (access counts, query log) run after the bundle is returned.

use chrono::{NaiveDate, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::{RehydrationConfig, RetrievalConfig};
use crate::deadline::{CancelToken, Deadline};
use crate::error::{CoreError, CoreResult};
use crate::llm::{Embedder, LlmError, Summarizer};
use crate::model::{QueryLogRecord, TopicId};
use crate::outcome::OutcomeLogger;
use crate::policy::PolicyEngine;
use crate::rehydrate::budget::{select_within_budget, CharEstimator, TokenEstimator};
use crate::rehydrate::bundle::{BundleItem, ContextBundle};
use crate::rehydrate::cache::{BundleCache, CacheKey};
use crate::rehydrate::intent::{Intent, IntentClassifier};
use crate::rehydrate::ranking::{rank, weights_for, RankedCandidate};
use crate::store::{HybridStore, SearchFilter};

/// Characters of item text quoted in per-item excerpt records
const EXCERPT_CHARS: usize = 160;

/// Minimum per-group summary budget
const MIN_GROUP_TOKENS: usize = 16;

/// One rehydration request
#[derive(Debug, Clone)]
pub struct RehydrateRequest {
    /// Requesting user
    pub user_id: String,
    /// Query text
    pub query: String,
    /// Topic scope (enforced when compliance mode is on)
    pub topic: TopicId,
    /// Caller-supplied intent; classified from the query when absent
    pub intent: Option<Intent>,
    /// Token budget for the bundle
    pub token_budget: usize,
    /// Compliance mode: restrict retrieval to `topic` and audit the filter
    pub compliance_mode: bool,
    /// Request deadline
    pub deadline: Deadline,
    /// Cooperative cancellation handle
    pub cancel: CancelToken,
}

/// The rehydration pipeline
pub struct Rehydrator {
    store: Arc<HybridStore>,
    embedder: Arc<dyn Embedder>,
    summarizer: Arc<dyn Summarizer>,
    policy: Arc<PolicyEngine>,
    outcomes: Arc<OutcomeLogger>,
    classifier: IntentClassifier,
    cache: BundleCache,
    estimator: Box<dyn TokenEstimator>,
    retrieval: RetrievalConfig,
    rehydration: RehydrationConfig,
    inflight: Arc<tokio::sync::Semaphore>,
    queued: AtomicUsize,
}

impl Rehydrator {
    /// Wire the pipeline
    pub fn new(
        store: Arc<HybridStore>,
        embedder: Arc<dyn Embedder>,
        summarizer: Arc<dyn Summarizer>,
        policy: Arc<PolicyEngine>,
        outcomes: Arc<OutcomeLogger>,
        retrieval: RetrievalConfig,
        rehydration: RehydrationConfig,
    ) -> Self {
        let classifier = IntentClassifier::new(&retrieval.extra_intents);
        let cache = BundleCache::new(
            Duration::from_secs(rehydration.cache_ttl_seconds),
            rehydration.cache_capacity,
        );
        let inflight = Arc::new(tokio::sync::Semaphore::new(rehydration.max_concurrent));
        Self {
            store,
            embedder,
            summarizer,
            policy,
            outcomes,
            classifier,
            cache,
            estimator: Box::new(CharEstimator),
            retrieval,
            rehydration,
            inflight,
            queued: AtomicUsize::new(0),
        }
    }

    /// Invalidate cached bundles that used an item (called by every
    /// user-facing mutation path)
    pub fn invalidate_item(&self, item_id: Uuid) {
        self.cache.invalidate_item(item_id);
    }

    /// Drop the whole cache (erasure)
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    /// Produce a context bundle for a query
    pub async fn rehydrate(&self, request: RehydrateRequest) -> CoreResult<ContextBundle> {
        // Stage 1: intent classification. A deadline too short even for
        // this returns immediately with no side effects.
        request.deadline.check("intent classification")?;
        request.cancel.check("intent classification")?;
        let intent = request
            .intent
            .clone()
            .unwrap_or_else(|| self.classifier.classify(&request.query));

        let key = CacheKey::new(
            &request.user_id,
            &request.query,
            &request.topic,
            &intent,
            request.compliance_mode,
        );
        if let Some(cached) = self.cache.get(&key) {
            let mut bundle = (*cached).clone();
            bundle.cache_hit = true;
            return Ok(bundle);
        }

        // Admission control: bounded queue in front of the concurrency
        // limit; anything beyond the queue depth is shed.
        if self.queued.fetch_add(1, Ordering::SeqCst) >= self.rehydration.queue_depth {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(CoreError::Overloaded("rehydration queue full".to_string()));
        }
        let permit = request
            .deadline
            .bound("admission", self.inflight.clone().acquire_owned())
            .await;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        let _permit = permit?.map_err(CoreError::internal)?;

        // Single-writer population per key
        let lock = self.cache.build_lock(&key);
        let _guard = lock.lock().await;
        if let Some(cached) = self.cache.get(&key) {
            let mut bundle = (*cached).clone();
            bundle.cache_hit = true;
            return Ok(bundle);
        }

        let bundle = self.build_bundle(&request, &intent).await?;

        // Cancellation and deadline-partial results never populate the
        // cache; the next identical query rebuilds.
        if !bundle.partial && !request.cancel.is_cancelled() {
            self.cache.insert(key, Arc::new(bundle.clone()));
        }
        self.spawn_side_effects(&request, &bundle);
        Ok(bundle)
    }

    async fn build_bundle(
        &self,
        request: &RehydrateRequest,
        intent: &Intent,
    ) -> CoreResult<ContextBundle> {
        let query_id = Uuid::new_v4();

        // Stage 2: candidate retrieval
        let retrieval_started = Instant::now();
        let query_vector = request
            .deadline
            .bound("query embedding", self.embedder.embed(&request.query, request.deadline))
            .await??;
        let filter = SearchFilter {
            topic: None,
            tier: None,
            min_score: self.retrieval.min_score,
            min_similarity: self.retrieval.min_similarity,
        };
        let candidates = self.store.search(
            &request.user_id,
            &query_vector,
            &filter,
            self.retrieval.k_candidates,
        )?;
        let retrieval_ms = retrieval_started.elapsed().as_millis() as u64;
        request.cancel.check("candidate retrieval")?;
        request.deadline.check("candidate retrieval")?;

        // Stage 4 (compliance half): the topic restriction is a policy
        // decision and is audited with original/surviving counts.
        let candidates = if request.compliance_mode {
            self.policy
                .compliance()
                .filter_topic(&request.user_id, &request.topic, candidates)?
        } else {
            candidates
        };
        let candidates = self
            .policy
            .compliance()
            .filter_bundle_pii(&request.user_id, candidates)?;

        // Stage 3: hybrid ranking
        let weights = weights_for(&self.retrieval, intent);
        let ranked = rank(candidates, weights, Utc::now());

        // Stage 5: token-budgeted selection
        let selected = select_within_budget(
            ranked,
            request.token_budget,
            self.rehydration.overhead_reserve_percent,
            self.estimator.as_ref(),
        );
        if selected.is_empty() {
            return Ok(ContextBundle::empty(query_id, intent, retrieval_ms));
        }
        request.cancel.check("selection")?;

        // Stage 6: grouped summarization, groups racing concurrently under
        // the remaining deadline
        let summarization_started = Instant::now();
        let (sections, partial) = self
            .summarize_groups(request, intent, &selected)
            .await?;
        let summarization_ms = summarization_started.elapsed().as_millis() as u64;

        if sections.is_empty() {
            return Err(CoreError::DeadlineExceeded("summarization".to_string()));
        }

        // Stage 7: bundle assembly
        let mut summary_parts = Vec::with_capacity(sections.len());
        let mut items = Vec::new();
        for (section_text, group) in &sections {
            summary_parts.push(section_text.clone());
            for candidate in group {
                items.push(BundleItem {
                    id: candidate.item.item.id,
                    tier: candidate.item.item.tier,
                    score: candidate.item.item.score,
                    excerpt: candidate.item.excerpt(EXCERPT_CHARS),
                    relevance: candidate.hybrid,
                    outcome_rate: candidate.outcome_rate,
                });
            }
        }
        let summary = summary_parts.join("\n\n");
        let total_tokens = self.estimator.estimate(&summary);

        Ok(ContextBundle {
            query_id,
            summary,
            items,
            intent_tag: intent.as_str().to_string(),
            total_tokens,
            retrieval_ms,
            summarization_ms,
            cache_hit: false,
            partial,
            generated_at: Utc::now(),
        })
    }

    /// Summarize the selected items grouped by (topic, creation day).
    ///
    /// Returns the completed sections and whether any group was cut off by
    /// the deadline. Backend failures other than timeouts propagate.
    async fn summarize_groups<'a>(
        &self,
        request: &RehydrateRequest,
        intent: &Intent,
        selected: &'a [RankedCandidate],
    ) -> CoreResult<(Vec<(String, Vec<&'a RankedCandidate>)>, bool)> {
        let mut groups: BTreeMap<(TopicId, NaiveDate), Vec<&RankedCandidate>> = BTreeMap::new();
        for candidate in selected {
            groups
                .entry((
                    candidate.item.item.topic.clone(),
                    candidate.item.item.created_at.date_naive(),
                ))
                .or_default()
                .push(candidate);
        }

        let total_tokens: usize = selected
            .iter()
            .map(|c| self.estimator.estimate(&c.item.text))
            .sum::<usize>()
            .max(1);
        let usable =
            crate::rehydrate::budget::usable_budget(request.token_budget, self.rehydration.overhead_reserve_percent);
        let remaining = request
            .deadline
            .remaining()
            .unwrap_or(Duration::from_secs(30));

        let futures: Vec<_> = groups
            .into_values()
            .map(|group| {
                let texts: Vec<String> = group.iter().map(|c| c.item.text.clone()).collect();
                let group_tokens: usize =
                    texts.iter().map(|t| self.estimator.estimate(t)).sum();
                let share = (usable * group_tokens / total_tokens).max(MIN_GROUP_TOKENS);
                let summarizer = self.summarizer.clone();
                let intent_tag = intent.as_str().to_string();
                let deadline = request.deadline;
                async move {
                    let result = tokio::time::timeout(
                        remaining,
                        summarizer.summarize(&texts, &intent_tag, share, deadline),
                    )
                    .await;
                    (group, result)
                }
            })
            .collect();

        let outcomes = futures::future::join_all(futures).await;

        let mut sections = Vec::new();
        let mut partial = false;
        for (group, result) in outcomes {
            match result {
                Ok(Ok(summary)) => {
                    let sources = group
                        .iter()
                        .map(|c| c.item.item.id.to_string())
                        .collect::<Vec<_>>()
                        .join(", ");
                    sections.push((format!("{summary}\n[sources: {sources}]"), group));
                }
                Ok(Err(LlmError::Timeout(_))) | Err(_) => {
                    partial = true;
                }
                Ok(Err(other)) => return Err(other.into()),
            }
        }
        Ok((sections, partial))
    }

    /// Post-return side effects: bump usage counters and write the query
    /// log (content hashes only).
    fn spawn_side_effects(&self, request: &RehydrateRequest, bundle: &ContextBundle) {
        if bundle.cache_hit {
            return;
        }
        let store = self.store.clone();
        let outcomes = self.outcomes.clone();
        let user_id = request.user_id.clone();
        let item_ids = bundle.item_ids();
        let record = QueryLogRecord {
            query_id: bundle.query_id,
            user_id: user_id.clone(),
            query_hash: blake3::hash(request.query.as_bytes()).to_hex().to_string(),
            item_ids: item_ids.clone(),
            response_hash: blake3::hash(bundle.summary.as_bytes()).to_hex().to_string(),
            timestamp: Utc::now(),
        };

        tokio::spawn(async move {
            let now = Utc::now();
            for item_id in &item_ids {
                let result = store.mutate(&user_id, *item_id, |item| {
                    item.access_count += 1;
                    item.last_used_at = now;
                });
                if let Err(e) = result {
                    tracing::warn!(%user_id, item_id = %item_id, error = %e, "usage update failed");
                }
            }
            if let Err(e) = outcomes.log_query(&record) {
                tracing::warn!(%user_id, error = %e, "query log write failed");
            }
        });
    }
}
