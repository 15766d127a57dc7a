use std::collections::BTreeMap;

/// An ordered list of named expressions plus scalar constants inlined at compile time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpressionSet {
    entries: Vec<(String, String)>,
    constants: BTreeMap<String, f64>,
}

impl ExpressionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set whose expressions are named after their own text.
    pub fn from_exprs<I, S>(exprs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::new();
        for e in exprs {
            let e = e.into();
            set.entries.push((e.clone(), e));
        }
        set
    }

    pub fn with(mut self, name: impl Into<String>, expr: impl Into<String>) -> Self {
        self.push(name, expr);
        self
    }

    pub fn push(&mut self, name: impl Into<String>, expr: impl Into<String>) {
        self.entries.push((name.into(), expr.into()));
    }

    pub fn constant(mut self, name: impl Into<String>, value: f64) -> Self {
        self.constants.insert(name.into(), value);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn exprs(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, e)| e.as_str())
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn constants(&self) -> &BTreeMap<String, f64> {
        &self.constants
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_keeps_order() {
        let set = ExpressionSet::new()
            .with("b", "x + 1")
            .with("a", "y")
            .constant("k", 2.0);
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(set.exprs().collect::<Vec<_>>(), vec!["x + 1", "y"]);
        assert_eq!(set.constants().get("k"), Some(&2.0));
    }

    #[test]
    fn test_from_exprs_names_by_text() {
        let set = ExpressionSet::from_exprs(["a.x", "a.y * 2"]);
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["a.x", "a.y * 2"]);
    }
}
