/// Multi-user scenarios: convergence, conflict handling and presence
use collab::*;

fn registry_with_session(
    settings: SessionSettings,
    file: &str,
    content: &str,
) -> (
    SessionRegistry,
    SessionId,
    EventBus,
    tokio::sync::mpsc::Receiver<SessionEvent>,
) {
    let (events, rx) = EventBus::channel(1024);

    let mut registry = SessionRegistry::new();
    let owner = User::new(UserId::new("u1"), "Alice", Role::Owner);
    let session_id = registry.create_session("review", "shared review", owner, settings, &events);
    registry
        .open_file(session_id, &UserId::new("u1"), file, content, &events)
        .unwrap();

    let bob = User::new(UserId::new("u2"), "Bob", Role::Developer);
    registry.join_session(session_id, bob, &events).unwrap();
    (registry, session_id, events, rx)
}

fn insert(user: &str, line: u32, column: u32, content: &str, ts: chrono::DateTime<chrono::Utc>) -> Change {
    Change::new(
        UserId::new(user),
        "main.rs",
        ChangeType::Insert,
        Position::new(line, column),
        content,
    )
    .with_timestamp(ts)
}

#[tokio::test]
async fn test_disjoint_edits_converge_across_interleavings() {
    let detector = ConflictDetector::new();
    let resolver = ConflictResolver::new();
    let base = chrono::Utc::now();

    // Two users editing different lines; any interleaving that respects
    // per-user order must converge to the same buffer
    let a1 = insert("u1", 0, 0, "fn ", base);
    let a2 = insert("u1", 0, 3, "main", base + chrono::Duration::milliseconds(10));
    let b1 = insert("u2", 1, 0, "// ", base + chrono::Duration::milliseconds(5));
    let b2 = insert("u2", 1, 3, "todo", base + chrono::Duration::milliseconds(15));

    let orders: Vec<Vec<Change>> = vec![
        vec![a1.clone(), a2.clone(), b1.clone(), b2.clone()],
        vec![b1.clone(), b2.clone(), a1.clone(), a2.clone()],
        vec![a1.clone(), b1.clone(), a2.clone(), b2.clone()],
        vec![b1, a1, b2, a2],
    ];

    let mut outcomes = Vec::new();
    for order in orders {
        let (mut registry, session_id, events, _rx) =
            registry_with_session(SessionSettings::default(), "main.rs", "x\ny");
        for change in order {
            assert!(
                registry
                    .apply_change(session_id, change, &detector, &resolver, &events)
                    .await
            );
        }
        outcomes.push(registry.get_session(session_id).unwrap().files["main.rs"].clone());
    }

    for outcome in &outcomes[1..] {
        assert_eq!(outcome, &outcomes[0]);
    }
}

#[tokio::test]
async fn test_conflicting_edits_resolve_end_to_end() {
    let detector = ConflictDetector::new();
    let resolver = ConflictResolver::new();
    let settings = SessionSettings {
        auto_resolve_conflicts: true,
        resolution_strategy: ResolutionStrategy::Merge,
    };
    let (mut registry, session_id, events, _rx) = registry_with_session(settings, "main.rs", "");

    let base = chrono::Utc::now();
    let first = insert("u1", 0, 0, "left", base);
    let second = insert("u2", 0, 0, "right", base + chrono::Duration::milliseconds(200));

    assert!(
        registry
            .apply_change(session_id, first, &detector, &resolver, &events)
            .await
    );
    assert!(
        registry
            .apply_change(session_id, second, &detector, &resolver, &events)
            .await
    );

    let session = registry.get_session(session_id).unwrap();
    assert_eq!(session.conflicts.len(), 1);
    assert!(session.conflicts[0].resolved);

    let resolution = session.conflicts[0].resolution.as_ref().unwrap();
    assert_eq!(resolution.content, "leftright");
    assert_eq!(resolution.user_id, UserId::system());

    let analytics = session.analytics();
    assert_eq!(analytics.conflict_count, 1);
    assert_eq!(analytics.resolved_conflict_count, 1);
    assert_eq!(analytics.conflict_resolution_rate, 1.0);
}

#[tokio::test]
async fn test_out_of_window_edits_do_not_conflict() {
    let detector = ConflictDetector::new();
    let resolver = ConflictResolver::new();
    let (mut registry, session_id, events, _rx) =
        registry_with_session(SessionSettings::default(), "main.rs", "");

    let base = chrono::Utc::now();
    let first = insert("u1", 0, 0, "a", base);
    let second = insert("u2", 0, 0, "b", base + chrono::Duration::milliseconds(5_100));

    assert!(
        registry
            .apply_change(session_id, first, &detector, &resolver, &events)
            .await
    );
    assert!(
        registry
            .apply_change(session_id, second, &detector, &resolver, &events)
            .await
    );
    assert!(registry.get_session(session_id).unwrap().conflicts.is_empty());
}

#[tokio::test]
async fn test_presence_updates_refresh_activity() {
    let (mut registry, session_id, _events, _rx) =
        registry_with_session(SessionSettings::default(), "main.rs", "");

    let stale = chrono::Utc::now() - chrono::Duration::minutes(10);
    registry
        .get_session_mut(session_id)
        .unwrap()
        .participants
        .get_mut(&UserId::new("u2"))
        .unwrap()
        .last_seen = stale;

    registry.update_cursor(session_id, &UserId::new("u2"), Position::new(4, 2));

    let session = registry.get_session(session_id).unwrap();
    let bob = session.participant(&UserId::new("u2")).unwrap();
    assert_eq!(bob.cursor, Some(Position::new(4, 2)));
    assert!(bob.last_seen > stale);
}

#[tokio::test]
async fn test_change_log_horizon_limits_conflict_scanning() {
    let detector = ConflictDetector::new();
    let resolver = ConflictResolver::new();
    let (mut registry, session_id, events, _rx) =
        registry_with_session(SessionSettings::default(), "main.rs", "seed");

    let base = chrono::Utc::now();

    // An early edit at the contested position
    let contested = insert("u1", 0, 0, "early", base);
    assert!(
        registry
            .apply_change(session_id, contested, &detector, &resolver, &events)
            .await
    );

    // Push the early edit out of the bounded log with disjoint edits
    for i in 0..CHANGE_LOG_CAP {
        let filler = insert("u1", 0, (i + 10) as u32, "x", base);
        assert!(
            registry
                .apply_change(session_id, filler, &detector, &resolver, &events)
                .await
        );
    }

    // A colliding edit arrives within the window, but its counterpart has
    // scrolled out of the scanning horizon
    let late = insert("u2", 0, 0, "late", base + chrono::Duration::milliseconds(100));
    assert!(
        registry
            .apply_change(session_id, late, &detector, &resolver, &events)
            .await
    );
    assert!(registry.get_session(session_id).unwrap().conflicts.is_empty());
}
