// Simulated collaborators
//
// Deterministic in-process stand-ins for the embedding provider, vector
// index, AI analyzer and the systems of record. The binary runs on these
// when no real providers are wired in; tests use them to inspect effects.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::collaborators::{
    CollaboratorError, Collaborators, DecisionStore, EmbeddingProvider, ReviewQueue,
    RiskAnalyzer, SimilarityIndex, TransactionStatusStore,
};
use crate::guards::review_priority;
use crate::risk::RiskEngine;
use crate::rules::RuleEngine;
use crate::types::{
    AnalysisRequest, Decision, DecisionReceipt, ReviewRequest, ReviewTicket, RiskAssessment,
    RuleAction, SimilarTransaction, TransactionStatus, Verdict,
};

// =============================================================================
// Embeddings
// =============================================================================

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Feature-hashing embedder: each token lands in a signed bucket
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text.split_whitespace() {
            let hash = fnv1a(token.to_lowercase().as_bytes());
            let bucket = (hash % self.dimensions as u64) as usize;
            let sign = if hash >> 63 == 1 { -1.0 } else { 1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model(&self) -> &str {
        "feature-hashing"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CollaboratorError> {
        if text.trim().is_empty() {
            return Err(CollaboratorError::Invalid("nothing to embed".to_string()));
        }
        Ok(self.embed_text(text))
    }
}

// =============================================================================
// Similarity index
// =============================================================================

/// Cosine similarity of two vectors of equal length
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let dot: f64 = a.iter().zip(b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum();
    let norm_a = a.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }
    Some(dot / (norm_a * norm_b))
}

struct IndexedTransaction {
    vector: Vec<f32>,
    verdict: Option<Verdict>,
}

/// Brute-force cosine index
#[derive(Default)]
pub struct InMemorySimilarityIndex {
    entries: RwLock<BTreeMap<String, IndexedTransaction>>,
}

impl InMemorySimilarityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a prior transaction with a known verdict
    pub fn seed(&self, transaction_id: impl Into<String>, vector: Vec<f32>, verdict: Verdict) {
        self.entries.write().insert(
            transaction_id.into(),
            IndexedTransaction {
                vector,
                verdict: Some(verdict),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl SimilarityIndex for InMemorySimilarityIndex {
    async fn search(
        &self,
        transaction_id: &str,
        vector: &[f32],
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<SimilarTransaction>, CollaboratorError> {
        let entries = self.entries.read();

        let mut matches = Vec::new();
        for (id, entry) in entries.iter().filter(|(id, _)| id.as_str() != transaction_id) {
            let similarity = cosine_similarity(vector, &entry.vector).ok_or_else(|| {
                CollaboratorError::Invalid(format!(
                    "vector has {} dimensions, index holds {}",
                    vector.len(),
                    entry.vector.len()
                ))
            })?;
            if similarity >= min_similarity {
                matches.push(SimilarTransaction {
                    transaction_id: id.clone(),
                    similarity,
                    verdict: entry.verdict,
                });
            }
        }

        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches.truncate(limit);
        Ok(matches)
    }

    async fn upsert(&self, transaction_id: &str, vector: Vec<f32>) -> Result<(), CollaboratorError> {
        let mut entries = self.entries.write();
        let verdict = entries.get(transaction_id).and_then(|e| e.verdict);
        entries.insert(transaction_id.to_string(), IndexedTransaction { vector, verdict });
        Ok(())
    }
}

// =============================================================================
// Risk analysis
// =============================================================================

/// Scores with the rule-based risk engine instead of a model
#[derive(Default)]
pub struct HeuristicAnalyzer {
    latency: Duration,
}

impl HeuristicAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a slow model call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl RiskAnalyzer for HeuristicAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<RiskAssessment, CollaboratorError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let transaction = &request.transaction;
        let mut risk_factors = RiskEngine::derived_flags(transaction);
        risk_factors.extend(transaction.risk_flags.iter().cloned());
        risk_factors.extend(request.rules.risk_flags.iter().cloned());
        risk_factors.sort();
        risk_factors.dedup();

        let rejected_neighbours = request
            .similar
            .iter()
            .filter(|case| case.verdict == Some(Verdict::Reject))
            .count();
        let risk_score = (RiskEngine::score(transaction, &request.rules.risk_flags)
            + 10.0 * rejected_neighbours as f64)
            .min(100.0);

        let rules_reject = matches!(
            request.rules.recommended_action,
            Some(RuleAction::Reject | RuleAction::Block)
        );
        let (verdict, confidence) = if rules_reject {
            (Verdict::Reject, 95.0)
        } else if risk_score >= 80.0 {
            (Verdict::Reject, 50.0 + risk_score * 0.45)
        } else if risk_score > 50.0 {
            (Verdict::Escalate, 60.0)
        } else {
            (Verdict::Approve, 100.0 - risk_score * 0.5)
        };

        let risk_level = RiskEngine::risk_level(risk_score);
        debug!(
            transaction_id = %transaction.transaction_id,
            risk_score,
            confidence,
            %verdict,
            "Heuristic analysis complete"
        );

        Ok(RiskAssessment {
            verdict,
            confidence,
            risk_score,
            risk_level,
            reasoning: format!(
                "risk score {risk_score:.0} from {} factor(s), {} similar case(s), {} rule(s) triggered",
                risk_factors.len(),
                request.similar.len(),
                request.rules.triggered_rules.len()
            ),
            risk_factors,
        })
    }
}

// =============================================================================
// Systems of record
// =============================================================================

/// Review queue keeping one review per transaction
#[derive(Default)]
pub struct InMemoryReviewQueue {
    reviews: Mutex<HashMap<String, (ReviewTicket, ReviewRequest)>>,
}

impl InMemoryReviewQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, transaction_id: &str) -> Option<ReviewTicket> {
        self.reviews.lock().get(transaction_id).map(|(ticket, _)| ticket.clone())
    }

    pub fn len(&self) -> usize {
        self.reviews.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reviews.lock().is_empty()
    }
}

#[async_trait]
impl ReviewQueue for InMemoryReviewQueue {
    async fn create_review(&self, request: &ReviewRequest) -> Result<ReviewTicket, CollaboratorError> {
        let mut reviews = self.reviews.lock();
        let (ticket, _) = reviews
            .entry(request.transaction_id.clone())
            .or_insert_with(|| {
                let ticket = ReviewTicket {
                    review_id: format!("REV-{}", request.transaction_id),
                    priority: review_priority(request.assessment.risk_score),
                };
                (ticket, request.clone())
            });
        Ok(ticket.clone())
    }
}

/// Decision store keyed by decision id
#[derive(Default)]
pub struct InMemoryDecisionStore {
    decisions: Mutex<HashMap<String, Decision>>,
}

impl InMemoryDecisionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, decision_id: &str) -> Option<Decision> {
        self.decisions.lock().get(decision_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.decisions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.lock().is_empty()
    }
}

#[async_trait]
impl DecisionStore for InMemoryDecisionStore {
    async fn save(&self, decision: &Decision) -> Result<DecisionReceipt, CollaboratorError> {
        let mut decisions = self.decisions.lock();
        let created = !decisions.contains_key(&decision.decision_id);
        if created {
            decisions.insert(decision.decision_id.clone(), decision.clone());
        }

        Ok(DecisionReceipt {
            decision_id: decision.decision_id.clone(),
            created,
        })
    }
}

/// Status store remembering every write
#[derive(Default)]
pub struct InMemoryStatusStore {
    statuses: Mutex<HashMap<String, Vec<TransactionStatus>>>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest status of a transaction
    pub fn status(&self, transaction_id: &str) -> Option<TransactionStatus> {
        self.statuses
            .lock()
            .get(transaction_id)
            .and_then(|history| history.last().copied())
    }

    pub fn history(&self, transaction_id: &str) -> Vec<TransactionStatus> {
        self.statuses
            .lock()
            .get(transaction_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl TransactionStatusStore for InMemoryStatusStore {
    async fn update_status(
        &self,
        transaction_id: &str,
        status: TransactionStatus,
    ) -> Result<(), CollaboratorError> {
        self.statuses
            .lock()
            .entry(transaction_id.to_string())
            .or_default()
            .push(status);
        Ok(())
    }
}

// =============================================================================
// Bundle
// =============================================================================

/// Concrete simulated backends, kept typed so callers can inspect them
#[derive(Clone)]
pub struct SimulatedBackends {
    pub embeddings: Arc<HashingEmbedder>,
    pub similarity: Arc<InMemorySimilarityIndex>,
    pub rules: Arc<RuleEngine>,
    pub analyzer: Arc<HeuristicAnalyzer>,
    pub reviews: Arc<InMemoryReviewQueue>,
    pub decisions: Arc<InMemoryDecisionStore>,
    pub statuses: Arc<InMemoryStatusStore>,
}

impl SimulatedBackends {
    pub fn new(embedding_dimensions: usize) -> Self {
        Self {
            embeddings: Arc::new(HashingEmbedder::new(embedding_dimensions)),
            similarity: Arc::new(InMemorySimilarityIndex::new()),
            rules: Arc::new(RuleEngine::default()),
            analyzer: Arc::new(HeuristicAnalyzer::new()),
            reviews: Arc::new(InMemoryReviewQueue::new()),
            decisions: Arc::new(InMemoryDecisionStore::new()),
            statuses: Arc::new(InMemoryStatusStore::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            embeddings: self.embeddings.clone(),
            similarity: self.similarity.clone(),
            rules: self.rules.clone(),
            analyzer: self.analyzer.clone(),
            reviews: self.reviews.clone(),
            decisions: self.decisions.clone(),
            statuses: self.statuses.clone(),
        }
    }
}
