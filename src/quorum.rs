//! Byzantine quorum math for the custodian set.

/// Minimum number of custodian signatures required for `n` custodians.
///
/// Tolerates `f = (n - 1) / 3` faulty custodians and requires `n - f`
/// signatures, which equals `floor(2n / 3) + 1` for every `n >= 1`.
/// An empty set has no quorum and yields 0; callers must reject it.
pub fn byzantine_threshold(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    n - (n - 1) / 3
}

/// Number of faulty custodians a set of `n` tolerates.
pub fn tolerated_faults(n: usize) -> usize {
    n.saturating_sub(1) / 3
}

/// True when `valid_signatures` distinct, verified signatures authorize an
/// outbound transaction for `n` custodians.
pub fn has_quorum(valid_signatures: usize, n: usize) -> bool {
    n > 0 && valid_signatures >= byzantine_threshold(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_table() {
        assert_eq!(byzantine_threshold(1), 1);
        assert_eq!(byzantine_threshold(2), 2);
        assert_eq!(byzantine_threshold(3), 3);
        assert_eq!(byzantine_threshold(4), 3);
        assert_eq!(byzantine_threshold(5), 4);
        assert_eq!(byzantine_threshold(7), 5);
        assert_eq!(byzantine_threshold(10), 7);
        assert_eq!(byzantine_threshold(15), 11);
    }

    #[test]
    fn test_threshold_matches_two_thirds_majority() {
        for n in 1..200usize {
            assert_eq!(byzantine_threshold(n), n * 2 / 3 + 1, "n = {}", n);
        }
    }

    #[test]
    fn test_faults_and_quorum() {
        assert_eq!(tolerated_faults(5), 1);
        assert_eq!(tolerated_faults(0), 0);
        assert!(!has_quorum(3, 5));
        assert!(has_quorum(4, 5));
        assert!(!has_quorum(0, 0));
    }
}
