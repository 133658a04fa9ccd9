//! Connection quality classification from the server's transport score.

use serde::Serialize;

/// Coarse quality label shown next to the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Good,
    Mid,
    Low,
    /// No score received yet for this call.
    #[default]
    Unknown,
}

/// Map a transport score (0..=10) to a label.
///
/// Scores are taken as reported; the latest score always wins.
pub fn classify(score: u32) -> ConnectionQuality {
    match score {
        0..=2 => ConnectionQuality::Low,
        3..=6 => ConnectionQuality::Mid,
        _ => ConnectionQuality::Good,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundaries() {
        assert_eq!(classify(0), ConnectionQuality::Low);
        assert_eq!(classify(2), ConnectionQuality::Low);
        assert_eq!(classify(3), ConnectionQuality::Mid);
        assert_eq!(classify(6), ConnectionQuality::Mid);
        assert_eq!(classify(7), ConnectionQuality::Good);
        assert_eq!(classify(10), ConnectionQuality::Good);
    }

    #[test]
    fn test_out_of_range_scores_are_good() {
        assert_eq!(classify(11), ConnectionQuality::Good);
        assert_eq!(classify(u32::MAX), ConnectionQuality::Good);
    }

    #[test]
    fn test_default_is_unknown() {
        assert_eq!(ConnectionQuality::default(), ConnectionQuality::Unknown);
    }
}
