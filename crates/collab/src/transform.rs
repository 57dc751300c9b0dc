/// Operational transform for concurrent inserts at the same coordinate
use crate::{Change, ChangeType};

/// Adjust a pair of concurrent changes so both can be applied without one
/// overwriting the other. Only two Inserts at the identical file position
/// are transformed: the earlier-timestamped change is left untouched and
/// the later change's column shifts right by the earlier content's length.
/// Every other combination passes through unchanged; richer Delete/Replace
/// transforms are a documented simplification.
///
/// Timestamps tie-break toward the first argument, so the function is
/// symmetric in its arguments.
pub fn transform(a: &Change, b: &Change) -> (Change, Change) {
    if a.file_path != b.file_path || a.position != b.position {
        return (a.clone(), b.clone());
    }
    if a.kind != ChangeType::Insert || b.kind != ChangeType::Insert {
        return (a.clone(), b.clone());
    }

    if a.timestamp <= b.timestamp {
        let mut shifted = b.clone();
        shifted.position.column += a.content.chars().count() as u32;
        (a.clone(), shifted)
    } else {
        let mut shifted = a.clone();
        shifted.position.column += b.content.chars().count() as u32;
        (shifted, b.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Position, UserId};

    fn insert_at(user: &str, position: Position, content: &str, ts_ms: i64) -> Change {
        Change::new(
            UserId::new(user),
            "main.rs",
            ChangeType::Insert,
            position,
            content,
        )
        .with_timestamp(chrono::DateTime::from_timestamp_millis(ts_ms).expect("valid timestamp"))
    }

    #[test]
    fn test_later_insert_shifts_right() {
        let at = Position::new(5, 10);
        let a = insert_at("alice", at, "foo", 100_000);
        let b = insert_at("bob", at, "bar", 100_050);

        let (a2, b2) = transform(&a, &b);
        assert_eq!(a2.position, at);
        assert_eq!(b2.position, Position::new(5, 13));
    }

    #[test]
    fn test_symmetric_in_argument_order() {
        let at = Position::new(5, 10);
        let a = insert_at("alice", at, "foo", 100_000);
        let b = insert_at("bob", at, "bar", 100_050);

        let (b2, a2) = transform(&b, &a);
        assert_eq!(a2.position, at);
        assert_eq!(b2.position, Position::new(5, 13));
    }

    #[test]
    fn test_different_positions_pass_through() {
        let a = insert_at("alice", Position::new(1, 0), "foo", 100_000);
        let b = insert_at("bob", Position::new(2, 0), "bar", 100_050);

        let (a2, b2) = transform(&a, &b);
        assert_eq!(a2.position, a.position);
        assert_eq!(b2.position, b.position);
    }

    #[test]
    fn test_non_insert_passes_through() {
        let at = Position::new(3, 3);
        let a = insert_at("alice", at, "foo", 100_000);
        let mut b = insert_at("bob", at, "bar", 100_050);
        b.kind = ChangeType::Delete;

        let (a2, b2) = transform(&a, &b);
        assert_eq!(a2.position, at);
        assert_eq!(b2.position, at);
    }

    #[test]
    fn test_multibyte_content_shifts_by_chars() {
        let at = Position::new(0, 0);
        let a = insert_at("alice", at, "héllo", 100_000);
        let b = insert_at("bob", at, "x", 100_050);

        let (_, b2) = transform(&a, &b);
        assert_eq!(b2.position.column, 5);
    }
}
