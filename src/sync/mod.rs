//! Comparing trees and moving changes between them.

pub mod compare;
pub mod filter;
pub mod flatten;
pub mod update;

pub use compare::{DiffCode, Difference};
pub use filter::NameFilter;
pub use update::UpdateOptions;

use crate::fs::error::AvmResult;
use crate::fs::operations::AvmService;
use crate::fs::path::AvmPath;
use crate::types::VersionRef;

use compare::{Side, compare_trees};

impl AvmService {
    /// Differences that would bring `dst_path` up to `src_path`, ancestors first.
    pub async fn compare(
        &self,
        src_version: impl Into<VersionRef>,
        src_path: &str,
        dst_version: impl Into<VersionRef>,
        dst_path: &str,
        filter: Option<&NameFilter>,
    ) -> AvmResult<Vec<Difference>> {
        let (src_version, dst_version) = (src_version.into(), dst_version.into());
        instrumented!(self.repo, "compare", {
            let source = self.side(src_version, src_path)?;
            let dest = self.side(dst_version, dst_path)?;
            let diffs = compare_trees(self.repo.as_ref(), &source, &dest, filter)?;
            tracing::debug!(
                source = %src_path,
                dest = %dst_path,
                differences = diffs.len(),
                "Compared trees"
            );
            Ok(diffs)
        })
    }

    fn side(&self, version: VersionRef, path: &str) -> AvmResult<Side> {
        let parsed = AvmPath::parse(path)?;
        let handle = self.repo.stores.get(&parsed.store)?;
        let version = match (version, parsed.version) {
            (VersionRef::Head, Some(v)) => VersionRef::At(v),
            (version, _) => version,
        };
        Ok(Side { store_id: handle.id, store_name: handle.name(), version, path: parsed.path })
    }
}
