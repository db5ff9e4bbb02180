/// A bus topic filter with single-level (`+`) and multi-level (`#`)
/// wildcards.
///
/// `#` is only valid as the final segment. Specificity is the number of
/// literal segments; the registry tries more specific patterns first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    SingleLevel,
    MultiLevel,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Self {
        let segments = pattern
            .split('/')
            .map(|s| match s {
                "+" => Segment::SingleLevel,
                "#" => Segment::MultiLevel,
                lit => Segment::Literal(lit.to_string()),
            })
            .collect();
        Self { segments }
    }

    /// Number of literal segments; higher matches win over wildcards.
    pub fn specificity(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }

    pub fn matches(&self, topic: &str) -> bool {
        let mut topic_segments = topic.split('/');
        let mut pattern_segments = self.segments.iter();

        loop {
            match (pattern_segments.next(), topic_segments.next()) {
                (Some(Segment::MultiLevel), _) => return true,
                (Some(Segment::SingleLevel), Some(_)) => {}
                (Some(Segment::Literal(lit)), Some(seg)) if lit == seg => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }

    /// Extract the topic segment matched by the first `+` wildcard.
    /// Used to pull the device id out of `home/system/+/...` topics.
    pub fn wildcard_segment<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let topic_segments: Vec<&str> = topic.split('/').collect();
        for (i, seg) in self.segments.iter().enumerate() {
            if matches!(seg, Segment::SingleLevel) {
                return topic_segments.get(i).copied();
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_patterns_match_exactly() {
        let p = TopicPattern::parse("home/garage/door/status");
        assert!(p.matches("home/garage/door/status"));
        assert!(!p.matches("home/garage/door/command"));
        assert!(!p.matches("home/garage/door"));
        assert!(!p.matches("home/garage/door/status/extra"));
    }

    #[test]
    fn single_level_wildcard_matches_one_segment() {
        let p = TopicPattern::parse("home/system/+/status");
        assert!(p.matches("home/system/garage-controller/status"));
        assert!(p.matches("home/system/house-monitor/status"));
        assert!(!p.matches("home/system/status"));
        assert!(!p.matches("home/system/a/b/status"));
    }

    #[test]
    fn multi_level_wildcard_matches_remainder() {
        let p = TopicPattern::parse("home/#");
        assert!(p.matches("home/garage/door/status"));
        assert!(p.matches("home/x"));
        assert!(!p.matches("work/x"));
    }

    #[test]
    fn wildcard_segment_extracts_device_id() {
        let p = TopicPattern::parse("home/system/+/sos");
        assert_eq!(
            p.wildcard_segment("home/system/house-monitor/sos"),
            Some("house-monitor")
        );
    }

    #[test]
    fn specificity_counts_literals() {
        assert_eq!(TopicPattern::parse("home/garage/door/status").specificity(), 4);
        assert_eq!(TopicPattern::parse("home/system/+/status").specificity(), 3);
        assert_eq!(TopicPattern::parse("home/+/status").specificity(), 2);
        assert_eq!(TopicPattern::parse("home/#").specificity(), 1);
    }
}
