//! Packages a built artifact into the `<name>-<version>.tar.gz` archive that gets published.

use crate::error::{self, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use snafu::ResultExt;
use tar::{EntryType, Header};

/// Builds a gzipped tarball holding `artifact` as a single executable file named `name`.
///
/// Headers carry no timestamps or ownership, so packaging the same bytes twice yields the same
/// archive.
pub fn create(name: &str, artifact: &[u8]) -> Result<Vec<u8>> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(artifact.len() as u64);
    header.set_mode(0o755);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut tarball = tar::Builder::new(encoder);
    tarball
        .append_data(&mut header, name, artifact)
        .context(error::ArchiveCreateSnafu { name })?;
    tarball
        .into_inner()
        .and_then(GzEncoder::finish)
        .context(error::ArchiveCreateSnafu { name })
}
