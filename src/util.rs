//! Small helpers shared across the broker.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Lock a std mutex, recovering the guard if a previous holder panicked.
///
/// Every table in this crate keeps its map consistent after each operation,
/// so a poisoned lock still guards valid state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn as_millis_u64(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Truncate a line for log output without splitting a UTF-8 character.
pub(crate) fn preview(line: &str, max: usize) -> String {
    if line.len() <= max {
        return line.to_string();
    }
    let mut idx = max;
    while idx > 0 && !line.is_char_boundary(idx) {
        idx -= 1;
    }
    format!("{}...", &line[..idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_respects_char_boundaries() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("abcdef", 3), "abc...");
        // 'é' is two bytes; cutting at 1 must back off to 0.
        assert_eq!(preview("é", 1), "...");
    }
}
