/// Change application: validation, conflict handling, buffer splicing
use tracing::{debug, warn};

use crate::{
    describe_conflict, transform, Change, ChangeType, CollabError, Conflict, ConflictDetector,
    ConflictResolver, EventBus, Position, ResolutionStrategy, Result, SessionEvent, SessionId,
    SessionRegistry,
};

/// An edit that passed validation and conflict detection, ready for
/// resolution and commit. Holding one does not pin the session; the
/// commit re-validates against current state.
pub struct StagedChange {
    change: Change,
    conflicts: Vec<Conflict>,
    strategy: ResolutionStrategy,
    auto_resolve: bool,
    resolution: Option<Change>,
}

impl StagedChange {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Run the configured strategy on the first detected conflict. This
    /// is the only suspension point of the pipeline; callers guarding
    /// session state with a lock release it around this call so a slow
    /// AI reviewer cannot stall unrelated sessions.
    pub async fn resolve(&mut self, resolver: &ConflictResolver) {
        if !self.auto_resolve {
            return;
        }
        if let Some(first) = self.conflicts.first_mut() {
            self.resolution = resolver.resolve(first, self.strategy).await;
        }
    }
}

impl SessionRegistry {
    /// Validate and apply an edit to a session. Returns false on any
    /// failure (missing session/user/file, permission denial, edit
    /// failure) without partial buffer mutation.
    pub async fn apply_change(
        &mut self,
        session_id: SessionId,
        change: Change,
        detector: &ConflictDetector,
        resolver: &ConflictResolver,
        events: &EventBus,
    ) -> bool {
        match self
            .try_apply_change(session_id, change, detector, resolver, events)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(session = %session_id.0, "change rejected: {e}");
                false
            }
        }
    }

    /// Same pipeline, but hands the applied change back so the transport
    /// can re-broadcast the possibly transformed or resolved edit.
    pub async fn try_apply_change(
        &mut self,
        session_id: SessionId,
        change: Change,
        detector: &ConflictDetector,
        resolver: &ConflictResolver,
        events: &EventBus,
    ) -> Result<Change> {
        let mut staged = self.stage_change(session_id, change, detector, events)?;
        staged.resolve(resolver).await;
        self.commit_change(session_id, staged, events)
    }

    /// First phase: existence and permission checks, then conflict
    /// detection over the bounded log. No buffer mutation.
    pub fn stage_change(
        &self,
        session_id: SessionId,
        change: Change,
        detector: &ConflictDetector,
        events: &EventBus,
    ) -> Result<StagedChange> {
        let session = self
            .sessions
            .get(&session_id)
            .ok_or_else(|| CollabError::SessionNotFound(session_id.0.to_string()))?;

        let user = session
            .participants
            .get(&change.user_id)
            .ok_or_else(|| CollabError::UserNotFound(change.user_id.0.clone()))?;
        if !user.can_write() {
            return Err(CollabError::PermissionDenied(change.user_id.0.clone()));
        }

        let strategy = session.settings.resolution_strategy;
        let auto_resolve = session.settings.auto_resolve_conflicts;

        let conflicts = detector.detect(&session.changes, &change, strategy);
        for conflict in &conflicts {
            debug!("{}", describe_conflict(session_id, conflict));
            events.publish(SessionEvent::ConflictDetected {
                session_id,
                conflict: conflict.clone(),
            });
        }

        Ok(StagedChange {
            change,
            conflicts,
            strategy,
            auto_resolve,
            resolution: None,
        })
    }

    /// Second phase: substitute the resolver's output or shift a colliding
    /// insert, splice the buffer, record the conflicts, append to the log.
    /// Session state may have moved since staging, so lookups run again.
    pub fn commit_change(
        &mut self,
        session_id: SessionId,
        staged: StagedChange,
        events: &EventBus,
    ) -> Result<Change> {
        let StagedChange {
            mut change,
            mut conflicts,
            auto_resolve,
            resolution,
            ..
        } = staged;

        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| CollabError::SessionNotFound(session_id.0.to_string()))?;
        let user = session
            .participants
            .get(&change.user_id)
            .ok_or_else(|| CollabError::UserNotFound(change.user_id.0.clone()))?;
        if !user.can_write() {
            return Err(CollabError::PermissionDenied(change.user_id.0.clone()));
        }

        if let Some(first) = conflicts.first_mut() {
            if let Some(resolved) = resolution {
                debug!(conflict = ?first.id.0, "substituting resolver output");
                events.publish(SessionEvent::ConflictResolved {
                    session_id,
                    conflict_id: first.id,
                    resolution: resolved.clone(),
                });
                change = resolved;
            } else if !auto_resolve && change.kind == ChangeType::Insert {
                // Shift the incoming insert past each colliding prior
                // insert so both insertions survive. The incoming change
                // is the last entry of the bundle.
                let priors = first.changes.len().saturating_sub(1);
                for prior in first.changes.iter().take(priors) {
                    if prior.kind == ChangeType::Insert {
                        let (_, shifted) = transform(prior, &change);
                        change = shifted;
                    }
                }
            }
        }
        session.conflicts.extend(conflicts);

        if change.kind.mutates_buffer() {
            let buffer = session
                .files
                .get_mut(&change.file_path)
                .ok_or_else(|| CollabError::FileNotFound(change.file_path.clone()))?;
            let edited = apply_edit(buffer, &change)?;
            *buffer = edited;
        }

        session.changes.push(change.clone());
        session.touch();
        events.publish(SessionEvent::ChangeApplied {
            session_id,
            change: change.clone(),
        });
        Ok(change)
    }
}

/// Compute the edited buffer for a single change. Pure: the caller swaps
/// the result in wholesale, so a failure never leaves a half-applied
/// buffer behind.
fn apply_edit(buffer: &str, change: &Change) -> Result<String> {
    match change.kind {
        ChangeType::Insert => splice_in(buffer, change.position, &change.content),

        ChangeType::Delete => {
            if !change.old_content.is_empty() {
                // First textual occurrence; an absent needle is a no-op
                Ok(buffer.replacen(&change.old_content, "", 1))
            } else {
                splice_out(buffer, change.position, change.content.chars().count())
            }
        }

        ChangeType::Replace => {
            if !change.old_content.is_empty() {
                Ok(buffer.replacen(&change.old_content, &change.content, 1))
            } else {
                // Zero characters replaced at the position: an insertion
                splice_in(buffer, change.position, &change.content)
            }
        }

        // Format/Move are logged without touching the buffer; cursor and
        // selection moves are presence updates
        _ => Ok(buffer.to_string()),
    }
}

fn splice_in(buffer: &str, position: Position, text: &str) -> Result<String> {
    let mut lines: Vec<String> = buffer.split('\n').map(str::to_string).collect();
    let line = lines
        .get_mut(position.line as usize)
        .ok_or_else(|| CollabError::EditFailed(format!("line {} out of range", position.line)))?;

    let at = byte_offset(line, position.column);
    line.insert_str(at, text);
    Ok(lines.join("\n"))
}

fn splice_out(buffer: &str, position: Position, count: usize) -> Result<String> {
    let mut lines: Vec<String> = buffer.split('\n').map(str::to_string).collect();
    let line = lines
        .get_mut(position.line as usize)
        .ok_or_else(|| CollabError::EditFailed(format!("line {} out of range", position.line)))?;

    let start = byte_offset(line, position.column);
    let end = byte_offset(line, position.column.saturating_add(count as u32));
    line.replace_range(start..end, "");
    Ok(lines.join("\n"))
}

/// Byte offset of a character column, clamped to the line end.
fn byte_offset(line: &str, column: u32) -> usize {
    line.char_indices()
        .nth(column as usize)
        .map(|(i, _)| i)
        .unwrap_or(line.len())
}
