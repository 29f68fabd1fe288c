//! Room keys and username rules.
//!
//! A direct conversation between two users lives under a key built from both
//! names in lexicographic order, so either participant derives the same key.
//! The public room is always the empty key and never goes through [`room`].

/// Joins the two names of a direct room. Never allowed inside a username.
pub const SEPARATOR: char = ':';

/// Key of the public room.
pub const PUBLIC: &str = "";

pub const MAX_NAME_LEN: usize = 32;

/// Canonical key for the direct room shared by `a` and `b`.
pub fn room(a: &str, b: &str) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{low}{SEPARATOR}{high}")
}

/// Returns the participant of `room_key` that is not `me`.
///
/// `None` for the public room or for keys that do not include `me`.
pub fn peer_in<'a>(room_key: &'a str, me: &str) -> Option<&'a str> {
    let (low, high) = room_key.split_once(SEPARATOR)?;
    if low == me {
        Some(high)
    } else if high == me {
        Some(low)
    } else {
        None
    }
}

/// Trims and checks a requested username.
pub fn normalize_username(raw: &str) -> Option<String> {
    let name = raw.trim();
    let valid = !name.is_empty()
        && name.chars().count() <= MAX_NAME_LEN
        && !name.contains(SEPARATOR)
        && !name.chars().any(char::is_control);

    valid.then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_is_commutative() {
        for (a, b) in [("alice", "bob"), ("B", "A"), ("zed", "amy"), ("a", "ab")] {
            assert_eq!(room(a, b), room(b, a));
        }
        assert_eq!(room("bob", "alice"), "alice:bob");
    }

    #[test]
    fn distinct_pairs_get_distinct_rooms() {
        assert_ne!(room("alice", "bob"), room("alice", "carol"));
        assert_ne!(room("a", "bc"), room("ab", "c"));
    }

    #[test]
    fn peer_in_resolves_the_other_participant() {
        let key = room("alice", "bob");
        assert_eq!(peer_in(&key, "alice"), Some("bob"));
        assert_eq!(peer_in(&key, "bob"), Some("alice"));
        assert_eq!(peer_in(&key, "carol"), None);
        assert_eq!(peer_in(PUBLIC, "alice"), None);
    }

    #[test]
    fn usernames_are_trimmed_and_validated() {
        assert_eq!(normalize_username("  alice "), Some("alice".to_string()));
        assert_eq!(normalize_username("   "), None);
        assert_eq!(normalize_username("al:ice"), None);
        assert_eq!(normalize_username("bad\nname"), None);
        assert_eq!(normalize_username(&"x".repeat(MAX_NAME_LEN + 1)), None);
    }
}
