/// Conflict detection and strategy-based resolution
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Change, ChangeLog, ChangeType, ConflictId, Result, SessionId, UserId};

/// Two edits at the same coordinate count as concurrent when their
/// timestamps are closer than this. A heuristic, not a causal check.
pub const CONFLICT_WINDOW_MS: i64 = 5_000;

/// A detected group of changes touching the same location within the
/// conflict window, from different authors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: ConflictId,
    pub file_path: String,

    /// All colliding changes; the incoming change is last. They share
    /// `file_path` and `position` by construction.
    #[serde(rename = "conflictingChanges")]
    pub changes: Vec<Change>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub detected_at: chrono::DateTime<chrono::Utc>,

    #[serde(rename = "resolutionStrategy")]
    pub strategy: ResolutionStrategy,

    pub resolved: bool,

    #[serde(rename = "resolutionChange")]
    pub resolution: Option<Change>,
}

/// Conflict resolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// The change with the latest timestamp wins
    LastWriterWins,

    /// The change with the earliest timestamp wins
    FirstWriterWins,

    /// Concatenate insert contents in list order
    Merge,

    /// Delegate to the external AI reviewer, fall back to Merge
    AiAssisted,
}

impl ResolutionStrategy {
    fn tag(&self) -> &'static str {
        match self {
            ResolutionStrategy::LastWriterWins => "last_writer_wins",
            ResolutionStrategy::FirstWriterWins => "first_writer_wins",
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::AiAssisted => "ai_assisted",
        }
    }
}

/// Scans the bounded change log for edits colliding with an incoming one
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    window_ms: i64,
}

impl ConflictDetector {
    pub fn new() -> Self {
        Self {
            window_ms: CONFLICT_WINDOW_MS,
        }
    }

    pub fn with_window_ms(window_ms: i64) -> Self {
        Self { window_ms }
    }

    /// Find logged changes colliding with `incoming`: same file, exact
    /// same position, different author, within the time window. All
    /// matches are bundled into a single conflict together with the
    /// incoming change.
    pub fn detect(
        &self,
        log: &ChangeLog,
        incoming: &Change,
        strategy: ResolutionStrategy,
    ) -> Vec<Conflict> {
        let mut colliding: Vec<Change> = Vec::new();

        for prior in log.iter() {
            if prior.file_path != incoming.file_path {
                continue;
            }
            if prior.position != incoming.position {
                continue;
            }
            if prior.user_id == incoming.user_id {
                continue;
            }
            let delta = (prior.timestamp - incoming.timestamp).num_milliseconds().abs();
            if delta >= self.window_ms {
                continue;
            }
            colliding.push(prior.clone());
        }

        if colliding.is_empty() {
            return Vec::new();
        }

        debug!(
            file = %incoming.file_path,
            count = colliding.len(),
            "detected colliding changes"
        );

        colliding.push(incoming.clone());
        vec![Conflict {
            id: ConflictId::new(),
            file_path: incoming.file_path.clone(),
            changes: colliding,
            detected_at: chrono::Utc::now(),
            strategy,
            resolved: false,
            resolution: None,
        }]
    }
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome produced by the external AI reviewer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiResolution {
    pub content: String,
    pub confidence: f64,
    pub explanation: String,
}

/// External AI collaborator, consumed as a single capability.
#[async_trait]
pub trait AiReviewer: Send + Sync {
    async fn resolve_conflict(&self, description: &str) -> Result<AiResolution>;
}

/// Strategy-selectable conflict resolver
pub struct ConflictResolver {
    ai: Option<Arc<dyn AiReviewer>>,
    ai_timeout: Duration,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self {
            ai: None,
            ai_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_ai(mut self, reviewer: Arc<dyn AiReviewer>) -> Self {
        self.ai = Some(reviewer);
        self
    }

    pub fn with_ai_timeout(mut self, timeout: Duration) -> Self {
        self.ai_timeout = timeout;
        self
    }

    /// Resolve a conflict with the given strategy. The output change is
    /// authored by `system` (or `ai_assistant`), tagged with the strategy
    /// in its metadata, and stored back on the conflict, which is marked
    /// resolved.
    pub async fn resolve(
        &self,
        conflict: &mut Conflict,
        strategy: ResolutionStrategy,
    ) -> Option<Change> {
        let resolution = match strategy {
            ResolutionStrategy::LastWriterWins => self.pick_writer(conflict, true),
            ResolutionStrategy::FirstWriterWins => self.pick_writer(conflict, false),
            ResolutionStrategy::Merge => self.merge(conflict),
            ResolutionStrategy::AiAssisted => match self.ai_assisted(conflict).await {
                Some(change) => Some(change),
                None => {
                    warn!(conflict = ?conflict.id.0, "AI resolution failed, falling back to merge");
                    self.merge(conflict)
                }
            },
        }?;

        conflict.resolved = true;
        conflict.resolution = Some(resolution.clone());
        Some(resolution)
    }

    /// Last- or first-writer-wins: the extreme-timestamp change becomes a
    /// Replace at its own position with its own content.
    fn pick_writer(&self, conflict: &Conflict, last: bool) -> Option<Change> {
        let winner = if last {
            conflict.changes.iter().max_by_key(|c| c.timestamp)?
        } else {
            conflict.changes.iter().min_by_key(|c| c.timestamp)?
        };

        let strategy = if last {
            ResolutionStrategy::LastWriterWins
        } else {
            ResolutionStrategy::FirstWriterWins
        };

        Some(
            Change::new(
                UserId::system(),
                winner.file_path.clone(),
                ChangeType::Replace,
                winner.position,
                winner.content.clone(),
            )
            .with_metadata("resolutionStrategy", strategy.tag().into()),
        )
    }

    /// Concatenate insert contents in list order; a later Replace
    /// overwrites the running merge entirely.
    fn merge(&self, conflict: &Conflict) -> Option<Change> {
        let first = conflict.changes.first()?;
        let mut merged = String::new();

        for change in &conflict.changes {
            match change.kind {
                ChangeType::Insert => merged.push_str(&change.content),
                ChangeType::Replace => merged = change.content.clone(),
                _ => {}
            }
        }

        Some(
            Change::new(
                UserId::system(),
                first.file_path.clone(),
                ChangeType::Replace,
                first.position,
                merged,
            )
            .with_metadata("resolutionStrategy", ResolutionStrategy::Merge.tag().into()),
        )
    }

    /// Hand the serialized conflict to the AI reviewer under a bounded
    /// timeout. Any failure (no reviewer, timeout, reviewer error) yields
    /// None so the caller can fall back to Merge.
    async fn ai_assisted(&self, conflict: &Conflict) -> Option<Change> {
        let reviewer = self.ai.as_ref()?;
        let first = conflict.changes.first()?;
        let description = serde_json::to_string(conflict).ok()?;

        let outcome = tokio::time::timeout(self.ai_timeout, reviewer.resolve_conflict(&description)).await;

        match outcome {
            Ok(Ok(resolution)) => Some(
                Change::new(
                    UserId::ai_assistant(),
                    first.file_path.clone(),
                    ChangeType::Replace,
                    first.position,
                    resolution.content,
                )
                .with_metadata(
                    "resolutionStrategy",
                    ResolutionStrategy::AiAssisted.tag().into(),
                )
                .with_metadata("confidence", resolution.confidence.into())
                .with_metadata("explanation", resolution.explanation.into()),
            ),
            Ok(Err(e)) => {
                warn!("AI reviewer error: {e}");
                None
            }
            Err(_) => {
                warn!(timeout = ?self.ai_timeout, "AI reviewer timed out");
                None
            }
        }
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable description of a conflict, used in logs and error
/// envelopes.
pub fn describe_conflict(session_id: SessionId, conflict: &Conflict) -> String {
    let authors: Vec<&str> = conflict
        .changes
        .iter()
        .map(|c| c.user_id.0.as_str())
        .collect();
    format!(
        "session {} file {} position {:?}: {} concurrent changes by [{}]",
        session_id.0,
        conflict.file_path,
        conflict.changes.first().map(|c| c.position),
        conflict.changes.len(),
        authors.join(", ")
    )
}
