/// Case-insensitive, dot-boundary domain suffix filter.
///
/// Accepts a name iff it equals the configured suffix or ends with
/// `.` + suffix. The suffix may be given with or without a leading dot
/// (`.jp` and `jp` behave identically).
#[derive(Debug, Clone)]
pub struct SuffixFilter {
    suffix: String,
    dotted: String,
}

impl SuffixFilter {
    pub fn new(suffix: &str) -> Self {
        let suffix = suffix.trim().trim_start_matches('.').to_ascii_lowercase();
        let dotted = format!(".{suffix}");
        Self { suffix, dotted }
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn matches(&self, name: &str) -> bool {
        if self.suffix.is_empty() {
            return false;
        }
        let name = name.trim().trim_end_matches('.').to_ascii_lowercase();
        name == self.suffix || name.ends_with(&self.dotted)
    }

    pub fn matches_any<'a, I>(&self, names: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        names.into_iter().any(|name| self.matches(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_boundary_and_case() {
        let filter = SuffixFilter::new(".jp");
        assert!(filter.matches("example.jp"));
        assert!(filter.matches("EXAMPLE.JP"));
        assert!(filter.matches("deep.sub.example.jp"));
        assert!(filter.matches("jp"));
        assert!(filter.matches("example.jp."));
        assert!(filter.matches("*.shop.jp"));

        assert!(!filter.matches("example.jpn"));
        assert!(!filter.matches("examplejp"));
        assert!(!filter.matches("example.com"));
        assert!(!filter.matches(""));
    }

    #[test]
    fn leading_dot_is_optional() {
        let a = SuffixFilter::new("jp");
        let b = SuffixFilter::new(".jp");
        assert_eq!(a.suffix(), b.suffix());
        assert!(a.matches("example.jp"));
    }

    #[test]
    fn matches_any_over_name_sets() {
        let filter = SuffixFilter::new(".jp");
        let names = ["c.example.com", "b.example.jp"];
        assert!(filter.matches_any(names.iter().copied()));
        assert!(!filter.matches_any(["c.example.com"].iter().copied()));
    }

    #[test]
    fn empty_suffix_matches_nothing() {
        let filter = SuffixFilter::new("");
        assert!(!filter.matches("example.jp"));
    }
}
