/// Longest topic name or filter a 2 byte length prefix can describe
pub const MAX_TOPIC_LEN: usize = 65535;

/// Checks if a topic or topic filter has wildcards
pub fn has_wildcards(s: impl AsRef<str>) -> bool {
    s.as_ref().contains(['+', '#'])
}

/// Rules shared by topic names and filters: at least one character, no
/// null character and no more than [`MAX_TOPIC_LEN`] bytes
fn is_valid_topic_or_filter(topic_or_filter: &str) -> bool {
    !topic_or_filter.is_empty()
        && topic_or_filter.len() <= MAX_TOPIC_LEN
        && !topic_or_filter.contains('\0')
}

/// Check if a topic is valid for PUBLISH packet
pub fn valid_topic(topic: impl AsRef<str>) -> bool {
    let topic = topic.as_ref();
    is_valid_topic_or_filter(topic) && !has_wildcards(topic)
}

/// Checks if the filter is valid for SUBSCRIBE and UNSUBSCRIBE.
///
/// `+` has to occupy a whole level, `#` has to occupy the whole last level
pub fn valid_filter(filter: impl AsRef<str>) -> bool {
    let filter = filter.as_ref();
    if !is_valid_topic_or_filter(filter) {
        return false;
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;

    levels.iter().enumerate().all(|(i, level)| match *level {
        "+" => true,
        "#" => i == last,
        level => !has_wildcards(level),
    })
}

/// Checks if topic matches a filter. Neither is validated here; filters
/// are validated when subscribing and topics when publishing.
///
/// Topics starting with `$` are reserved for the broker and are only matched
/// by filters which spell out the first level
pub fn matches(topic: impl AsRef<str>, filter: impl AsRef<str>) -> bool {
    let topic = topic.as_ref();
    let filter = filter.as_ref();

    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut topics = topic.split('/');
    for f in filter.split('/') {
        // `#` also matches the parent level: `a/#` matches `a`
        if f == "#" {
            return true;
        }

        match topics.next() {
            Some(_) if f == "+" => continue,
            Some(t) if t == f => continue,
            _ => return false,
        }
    }

    // filter is exhausted, topic must be too
    topics.next().is_none()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wildcards_are_detected_correctly() {
        assert!(!has_wildcards("a/b/c"));
        assert!(has_wildcards("a/+/c"));
        assert!(has_wildcards("a/b/#"));
    }

    #[test]
    fn topics_are_validated_correctly() {
        assert!(valid_topic("sample/topic1"));
        assert!(valid_topic("/"));
        assert!(!valid_topic(""));
        assert!(!valid_topic("+wrong"));
        assert!(!valid_topic("wro#ng"));
        assert!(!valid_topic("wrong/#/path"));
        assert!(!valid_topic("nul\0l"));
        assert!(!valid_topic("a".repeat(MAX_TOPIC_LEN + 1)));
    }

    #[test]
    fn filters_are_validated_correctly() {
        assert!(valid_filter("correct/filter/#"));
        assert!(valid_filter("cor/+/rect/+"));
        assert!(valid_filter("#"));
        assert!(valid_filter("+"));
        assert!(!valid_filter("wrong/#/filter"));
        assert!(!valid_filter("wrong/wr#ng/filter"));
        assert!(!valid_filter("wrong/filter#"));
        assert!(!valid_filter("wr/o+/ng"));
        assert!(!valid_filter("wr/+o+/ng"));
        assert!(!valid_filter("wron/+g"));
        assert!(!valid_filter(""));
    }

    #[test]
    fn single_level_wildcard_matches_exactly_one_level() {
        assert!(matches("sample/topic1", "sample/+"));
        assert!(!matches("other/topic1", "sample/+"));
        assert!(!matches("sample", "sample/+"));
        assert!(!matches("sample/topic1/extra", "sample/+"));
        assert!(matches("sample/", "sample/+"));
        assert!(matches("a/b/c", "+/b/+"));
    }

    #[test]
    fn multi_level_wildcard_matches_the_rest() {
        assert!(matches("sample/topic1", "sample/#"));
        assert!(matches("sample/a/b/c", "sample/#"));
        assert!(matches("sample", "sample/#"));
        assert!(matches("anything/at/all", "#"));
        assert!(!matches("other/topic1", "sample/#"));
    }

    #[test]
    fn exact_filters_need_exact_topics() {
        assert!(matches("a/b/c", "a/b/c"));
        assert!(!matches("a/b/c", "a/b"));
        assert!(!matches("a/b", "a/b/c"));
        assert!(!matches("/a", "a"));
    }

    #[test]
    fn dollar_topics_need_an_explicit_first_level() {
        assert!(!matches("$SYS/uptime", "#"));
        assert!(!matches("$SYS/uptime", "+/uptime"));
        assert!(matches("$SYS/uptime", "$SYS/#"));
        assert!(matches("$SYS/uptime", "$SYS/+"));
    }
}
