/// Registry of named sources
use std::path::{Path, PathBuf};

use super::npz::NpzRecordSource;
use super::source::ChunkSource;
use crate::{EvalError, Result};

/// Which sources to fetch from a [`Supplier`]
#[derive(Debug, Clone, Copy)]
pub enum Sources<'a> {
    /// Every registered source, in registration order
    All,
    /// A single source
    One(&'a str),
    /// Exactly these sources, in this order
    Many(&'a [&'a str]),
}

impl<'a> From<&'a str> for Sources<'a> {
    fn from(name: &'a str) -> Self {
        Sources::One(name)
    }
}

impl<'a> From<&'a [&'a str]> for Sources<'a> {
    fn from(names: &'a [&'a str]) -> Self {
        Sources::Many(names)
    }
}

/// A bundle of named sources, kept in registration order
#[derive(Default)]
pub struct Supplier {
    data: Vec<(String, Box<dyn ChunkSource>)>,
}

impl Supplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a supplier from a text file listing one record archive per line.
    ///
    /// Each of `fields` becomes an [`NpzRecordSource`] over the same files.
    pub fn from_file_list<P: AsRef<Path>>(path: P, fields: &[&str]) -> Result<Self> {
        let listing = std::fs::read_to_string(path.as_ref())?;
        let base = path.as_ref().parent().unwrap_or_else(|| Path::new(""));

        let fnames: Vec<PathBuf> = listing
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| base.join(line))
            .collect();

        log::info!(
            "Found {} records in {:?} for fields {:?}",
            fnames.len(),
            path.as_ref(),
            fields
        );

        let mut supplier = Self::new();
        for field in fields {
            let source = NpzRecordSource::new(*field, fnames.clone())?;
            supplier.add_source(*field, Box::new(source))?;
        }
        Ok(supplier)
    }

    /// Register a source; names must be unique
    pub fn add_source(
        &mut self,
        name: impl Into<String>,
        source: Box<dyn ChunkSource>,
    ) -> Result<()> {
        let name = name.into();
        if self.data.iter().any(|(n, _)| *n == name) {
            return Err(EvalError::Config(format!(
                "source '{}' is already registered",
                name
            )));
        }
        self.data.push((name, source));
        Ok(())
    }

    /// Registered names in registration order
    pub fn keys(&self) -> Vec<&str> {
        self.data.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Resolve a selection into indices, failing on the first unknown name
    fn resolve(&self, selection: Sources<'_>) -> Result<Vec<usize>> {
        let names: Vec<&str> = match selection {
            Sources::All => return Ok((0..self.data.len()).collect()),
            Sources::One(name) => vec![name],
            Sources::Many(names) => names.to_vec(),
        };

        names
            .into_iter()
            .map(|name| {
                self.data
                    .iter()
                    .position(|(n, _)| n == name)
                    .ok_or_else(|| EvalError::UnknownSourceKey {
                        key: name.to_string(),
                        valid: self.data.iter().map(|(n, _)| n.clone()).collect(),
                    })
            })
            .collect()
    }

    /// Look up sources by name.
    ///
    /// Either every requested name resolves or nothing is returned.
    pub fn get_sources<'s>(
        &self,
        selection: impl Into<Sources<'s>>,
    ) -> Result<Vec<(&str, &dyn ChunkSource)>> {
        let indices = self.resolve(selection.into())?;
        Ok(indices
            .into_iter()
            .map(|i| {
                let (name, source) = &self.data[i];
                (name.as_str(), source.as_ref())
            })
            .collect())
    }

    /// Hand the selected sources over, e.g. to a provider
    pub fn into_sources<'s>(
        self,
        selection: impl Into<Sources<'s>>,
    ) -> Result<Vec<(String, Box<dyn ChunkSource>)>> {
        let indices = self.resolve(selection.into())?;

        let mut slots: Vec<Option<(String, Box<dyn ChunkSource>)>> =
            self.data.into_iter().map(Some).collect();

        indices
            .into_iter()
            .map(|i| {
                slots[i].take().ok_or_else(|| {
                    EvalError::Config("source requested more than once".to_string())
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::npz::tests::write_records;
    use crate::data::InMemorySource;
    use ndarray::array;

    fn registry() -> Supplier {
        let mut supplier = Supplier::new();
        let x = InMemorySource::new("x", array![[1.0f32], [2.0]].into_dyn()).unwrap();
        let y = InMemorySource::new("y", array![[0.0f32], [1.0]].into_dyn()).unwrap();
        supplier.add_source("x", Box::new(x)).unwrap();
        supplier.add_source("y", Box::new(y)).unwrap();
        supplier
    }

    #[test]
    fn test_get_all_sources() -> Result<()> {
        let supplier = registry();
        let names: Vec<&str> = supplier
            .get_sources(Sources::All)?
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["x", "y"]);
        Ok(())
    }

    #[test]
    fn test_get_single_and_many() -> Result<()> {
        let supplier = registry();

        let one = supplier.get_sources("y")?;
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].0, "y");

        let many = supplier.get_sources(Sources::Many(&["y", "x"]))?;
        assert_eq!(many.iter().map(|(n, _)| *n).collect::<Vec<_>>(), vec!["y", "x"]);
        Ok(())
    }

    #[test]
    fn test_unknown_key_lists_valid_keys() {
        let supplier = registry();
        let err = supplier.get_sources(Sources::Many(&["z"])).err().unwrap();

        match &err {
            EvalError::UnknownSourceKey { key, valid } => {
                assert_eq!(key, "z");
                assert_eq!(valid, &vec!["x".to_string(), "y".to_string()]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(err.to_string(), "Invalid data key: z. Valid keys are: x, y");
    }

    #[test]
    fn test_no_partial_success() {
        let supplier = registry();
        assert!(supplier.get_sources(Sources::Many(&["x", "z"])).is_err());
        assert!(supplier.into_sources(Sources::Many(&["x", "z"])).is_err());
    }

    #[test]
    fn test_into_sources_transfers_ownership() -> Result<()> {
        let sources = registry().into_sources(Sources::Many(&["y"]))?;
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].0, "y");
        assert_eq!(sources[0].1.len(), 2);

        assert!(registry().into_sources(Sources::Many(&["x", "x"])).is_err());
        Ok(())
    }

    #[test]
    fn test_duplicate_registration() {
        let mut supplier = registry();
        let again = InMemorySource::new("x", array![[1.0f32]].into_dyn()).unwrap();
        assert!(matches!(
            supplier.add_source("x", Box::new(again)),
            Err(EvalError::Config(_))
        ));
    }

    #[test]
    fn test_from_file_list() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("streameval_list_{}", std::process::id()));
        let fnames = write_records(&dir, 4);

        let listing: String = fnames
            .iter()
            .map(|p| format!("  {}  \n", p.file_name().unwrap().to_string_lossy()))
            .chain(std::iter::once("\n".to_string()))
            .collect();
        let list_path = dir.join("records.txt");
        std::fs::write(&list_path, listing)?;

        let supplier = Supplier::from_file_list(&list_path, &["x", "y"]);
        std::fs::remove_dir_all(&dir).ok();
        let supplier = supplier?;

        assert_eq!(supplier.keys(), vec!["x", "y"]);
        let sources = supplier.get_sources(Sources::All)?;
        assert_eq!(sources[0].1.len(), 4);
        assert_eq!(sources[0].1.shape(), &[2]);
        assert_eq!(sources[1].1.shape(), &[1]);
        Ok(())
    }
}
