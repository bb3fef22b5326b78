//! Routing-key patterns for topic bindings. Dot-delimited; `*` matches
//! exactly one segment, `#` matches zero or more segments.

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    One,
    Many,
}

/// A compiled binding pattern, e.g. `*.*.iaq` or `*.#.fault`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn new(pattern: &str) -> Self {
        let segments = pattern
            .split('.')
            .map(|s| match s {
                "*" => Segment::One,
                "#" => Segment::Many,
                literal => Segment::Literal(literal.to_owned()),
            })
            .collect();
        Self { segments }
    }

    pub fn matches(&self, routing_key: &str) -> bool {
        let key: Vec<&str> = routing_key.split('.').collect();
        matches_at(&self.segments, &key)
    }
}

fn matches_at(pattern: &[Segment], key: &[&str]) -> bool {
    match pattern.first() {
        None => key.is_empty(),
        Some(Segment::Many) => {
            (0..=key.len()).any(|skip| matches_at(&pattern[1..], &key[skip..]))
        }
        Some(Segment::One) => !key.is_empty() && matches_at(&pattern[1..], &key[1..]),
        Some(Segment::Literal(want)) => {
            key.first() == Some(&want.as_str()) && matches_at(&pattern[1..], &key[1..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_pattern_matches_itself_only() {
        let p = TopicPattern::new("2.3.iaq");
        assert!(p.matches("2.3.iaq"));
        assert!(!p.matches("2.3.power"));
        assert!(!p.matches("2.3"));
        assert!(!p.matches("2.3.iaq.extra"));
    }

    #[test]
    fn star_matches_exactly_one_segment() {
        let p = TopicPattern::new("*.*.fault");
        assert!(p.matches("1.1.fault"));
        assert!(p.matches("3.5.fault"));
        assert!(!p.matches("1.fault"));
        assert!(!p.matches("1.1.1.fault"));
        assert!(!p.matches("1.1.iaq"));
    }

    #[test]
    fn hash_matches_zero_or_more_segments() {
        let p = TopicPattern::new("#");
        assert!(p.matches("1.2.iaq"));
        assert!(p.matches("anything"));

        let p = TopicPattern::new("*.#.fault");
        assert!(p.matches("1.fault"));
        assert!(p.matches("1.2.fault"));
        assert!(p.matches("1.2.3.fault"));
        assert!(!p.matches("fault"));
    }

    #[test]
    fn star_is_a_segment_wildcard_not_a_substring_one() {
        let p = TopicPattern::new("*.*.*");
        assert!(p.matches("1.2.presence"));
        assert!(!p.matches("1.2"));
    }
}
