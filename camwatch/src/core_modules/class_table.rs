//! Class-name table: ordered names where line N of the file is class id N.

use std::path::Path;

use crate::error::ModelLoadError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassTable {
    names: Vec<String>,
}

impl ClassTable {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ModelLoadError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ModelLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let table = Self::parse(&content);
        if table.is_empty() {
            return Err(ModelLoadError::EmptyClassTable(path.to_path_buf()));
        }
        Ok(table)
    }

    /// Trailing newlines are dropped; blank lines in the middle keep their id.
    pub fn parse(content: &str) -> Self {
        let trimmed = content.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() {
            return Self { names: Vec::new() };
        }
        Self::new(trimmed.lines().map(|line| line.trim_end_matches('\r')))
    }

    /// Resolves a 1-indexed class id.
    pub fn resolve(&self, class_id: i32) -> Option<&str> {
        let index = usize::try_from(class_id).ok()?.checked_sub(1)?;
        self.names.get(index).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_resolve_is_one_indexed() {
        let table = ClassTable::new(["person", "bicycle", "car"]);
        assert_eq!(table.resolve(1), Some("person"));
        assert_eq!(table.resolve(3), Some("car"));
        assert_eq!(table.resolve(0), None);
        assert_eq!(table.resolve(4), None);
        assert_eq!(table.resolve(-1), None);
    }

    #[test]
    fn test_parse_strips_trailing_newlines() {
        let table = ClassTable::parse("person\r\nbicycle\r\ncar\n\n");
        assert_eq!(table.len(), 3);
        assert_eq!(table.resolve(2), Some("bicycle"));
        assert!(table.contains("car"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "person").unwrap();
        writeln!(file, "bicycle").unwrap();
        let table = ClassTable::from_file(file.path()).unwrap();
        assert_eq!(table.names().collect::<Vec<_>>(), vec!["person", "bicycle"]);
    }

    #[test]
    fn test_from_file_empty_is_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = ClassTable::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ModelLoadError::EmptyClassTable(_)));
    }

    #[test]
    fn test_from_file_missing_is_error() {
        let err = ClassTable::from_file("/nonexistent/coco.names").unwrap_err();
        assert!(matches!(err, ModelLoadError::Io { .. }));
    }
}
