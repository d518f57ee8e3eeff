use crate::{Error, Result};
use glob::Pattern;

/// Compiled `exclude_patterns` (§6 Configuration), matched against a path
/// relative to its sync root.
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    patterns: Vec<Pattern>,
}

impl ExcludeSet {
    pub fn compile(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| Pattern::new(p).map_err(|e| Error::BadPattern(p.clone(), e)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_excluded(&self, relative_path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(relative_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_glob_against_relative_path() {
        let set = ExcludeSet::compile(&["*.tmp".into(), "node_modules/**".into()]).unwrap();
        assert!(set.is_excluded("foo.tmp"));
        assert!(set.is_excluded("node_modules/pkg/index.js"));
        assert!(!set.is_excluded("src/main.rs"));
    }

    #[test]
    fn rejects_invalid_pattern() {
        assert!(ExcludeSet::compile(&["[".into()]).is_err());
    }
}
