use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Writes one transfer's captured send/receive stderr as a gzip file in
/// `dir`, named after the subvolume's target path with separators flattened.
pub fn save_transfer_log(
    dir: &Path,
    subvol_path: &Path,
    data: &[u8],
    compresslevel: u32,
) -> Result<PathBuf> {
    let name = subvol_path
        .to_string_lossy()
        .replace(std::path::MAIN_SEPARATOR, "_");
    let log_path = dir.join(format!("{}.log.gz", name));
    let file = File::create(&log_path)
        .context(format!("Failed to create transfer log {:?}.", log_path))?;
    let mut encoder = GzEncoder::new(file, Compression::new(compresslevel));
    encoder
        .write_all(data)
        .context(format!("Failed to write transfer log {:?}.", log_path))?;
    encoder
        .finish()
        .context(format!("Failed to finish transfer log {:?}.", log_path))?;
    Ok(log_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn log_round_trips_and_flattens_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_transfer_log(
            dir.path(),
            Path::new("snaps/daily/one"),
            b"At subvol one\n",
            6,
        )
        .unwrap();
        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            "snaps_daily_one.log.gz"
        );

        let mut decoder = GzDecoder::new(File::open(&path).unwrap());
        let mut contents = String::new();
        decoder.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "At subvol one\n");
    }
}
