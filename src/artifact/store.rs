use std::ops::Index;

use crate::artifact::{Artifact, KindQuery};
use crate::error::Result;

/// Ordered collection of the artifacts produced during one chain run.
///
/// Insertion order is preserved. Every mutation validates the incoming
/// artifacts before touching the list, so a rejected batch leaves the store
/// unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactStore {
    items: Vec<Artifact>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_artifacts(items: impl IntoIterator<Item = Artifact>) -> Result<Self> {
        let mut store = Self::new();
        store.extend(items)?;
        Ok(store)
    }

    pub fn append(&mut self, artifact: Artifact) -> Result<()> {
        artifact.validate()?;
        self.items.push(artifact);
        Ok(())
    }

    /// Insert at `index`, clamped to the end of the list.
    pub fn insert(&mut self, index: usize, artifact: Artifact) -> Result<()> {
        artifact.validate()?;
        let index = index.min(self.items.len());
        self.items.insert(index, artifact);
        Ok(())
    }

    pub fn extend(&mut self, artifacts: impl IntoIterator<Item = Artifact>) -> Result<()> {
        let batch: Vec<Artifact> = artifacts.into_iter().collect();
        for artifact in &batch {
            artifact.validate()?;
        }
        self.items.extend(batch);
        Ok(())
    }

    /// All artifacts matching `query`, in insertion order.
    ///
    /// The store is left unchanged. Specializing queries match every kind
    /// they cover, so `KindQuery::Signable` returns kernels and UKIs alike.
    ///
    /// # Arguments
    ///
    /// * `query` - An [`ArtifactKind`](crate::artifact::ArtifactKind) for an
    ///   exact match, or a [`KindQuery`]
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// use bootchain::artifact::{ArtifactKind, KindQuery};
    ///
    /// let kernels = store.by_kind(ArtifactKind::Kernel);
    /// let signable = store.by_kind(KindQuery::Signable);
    /// ```
    pub fn by_kind(&self, query: impl Into<KindQuery>) -> Vec<&Artifact> {
        let query = query.into();
        self.items
            .iter()
            .filter(|artifact| query.matches(artifact.kind()))
            .collect()
    }

    /// The most recently appended artifact matching `query`. This is the
    /// artifact a link receives for a declared input.
    pub fn latest(&self, query: impl Into<KindQuery>) -> Option<&Artifact> {
        let query = query.into();
        self.items
            .iter()
            .rev()
            .find(|artifact| query.matches(artifact.kind()))
    }

    pub fn at(&self, index: usize) -> Option<&Artifact> {
        self.items.get(index)
    }

    pub fn installed(&self) -> impl Iterator<Item = &Artifact> {
        self.items.iter().filter(|artifact| artifact.installed)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Artifact> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_vec(self) -> Vec<Artifact> {
        self.items
    }
}

impl Index<usize> for ArtifactStore {
    type Output = Artifact;

    fn index(&self, index: usize) -> &Artifact {
        &self.items[index]
    }
}

impl<'a> IntoIterator for &'a ArtifactStore {
    type Item = &'a Artifact;
    type IntoIter = std::slice::Iter<'a, Artifact>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactKind;
    use std::path::PathBuf;

    fn art(kind: ArtifactKind, path: &str) -> Artifact {
        Artifact::new(kind, "test/step", path)
    }

    #[test]
    fn by_kind_preserves_insertion_order_and_does_not_remove() {
        let mut store = ArtifactStore::new();
        store.append(art(ArtifactKind::Kernel, "/k1")).unwrap();
        store.append(art(ArtifactKind::Initrd, "/i1")).unwrap();
        store.append(art(ArtifactKind::Kernel, "/k2")).unwrap();

        let kernels: Vec<PathBuf> = store
            .by_kind(ArtifactKind::Kernel)
            .into_iter()
            .map(|a| a.path.clone())
            .collect();
        assert_eq!(kernels, vec![PathBuf::from("/k1"), PathBuf::from("/k2")]);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn signable_query_returns_kernels_and_ukis() {
        let mut store = ArtifactStore::new();
        store.append(art(ArtifactKind::Kernel, "/k")).unwrap();
        store.append(art(ArtifactKind::Config, "/c")).unwrap();
        store.append(art(ArtifactKind::Uki, "/u")).unwrap();

        let signable = store.by_kind(KindQuery::Signable);
        assert_eq!(signable.len(), 2);
        assert_eq!(signable[0].kind(), ArtifactKind::Kernel);
        assert_eq!(signable[1].kind(), ArtifactKind::Uki);
        assert_eq!(store.by_kind(KindQuery::AnyFile).len(), 3);
    }

    #[test]
    fn latest_wins() {
        let mut store = ArtifactStore::new();
        store.append(art(ArtifactKind::Kernel, "/k1")).unwrap();
        store.append(art(ArtifactKind::Uki, "/u1")).unwrap();
        assert_eq!(store.latest(KindQuery::Signable).unwrap().path, PathBuf::from("/u1"));
        assert!(store.latest(ArtifactKind::Initrd).is_none());
    }

    #[test]
    fn rejected_batch_leaves_store_untouched() {
        let mut store = ArtifactStore::new();
        store.append(art(ArtifactKind::Kernel, "/k")).unwrap();

        let result = store.extend(vec![
            art(ArtifactKind::Initrd, "/i"),
            art(ArtifactKind::Config, "relative/config"),
        ]);
        assert!(result.is_err());
        assert_eq!(store.len(), 1);

        assert!(store.insert(0, art(ArtifactKind::Config, "nope")).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn positional_access() {
        let store = ArtifactStore::from_artifacts(vec![
            art(ArtifactKind::Config, "/c"),
            art(ArtifactKind::Symbols, "/s"),
        ])
        .unwrap();
        assert_eq!(store[1].kind(), ArtifactKind::Symbols);
        assert_eq!(store.at(0).unwrap().kind(), ArtifactKind::Config);
        assert!(store.at(2).is_none());
    }

    #[test]
    fn installed_filter() {
        let mut store = ArtifactStore::new();
        store.append(art(ArtifactKind::Kernel, "/scratch/k")).unwrap();
        store
            .append(art(ArtifactKind::Kernel, "/boot/vmlinuz").with_installed(true))
            .unwrap();
        let installed: Vec<_> = store.installed().collect();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].path, PathBuf::from("/boot/vmlinuz"));
    }
}
