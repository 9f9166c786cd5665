//! Seed list parsing.

use crate::error::{CrawlError, Result};
use std::fs;
use std::path::Path;
use url::Url;

/// Read seed URLs from a plain text file, one per line. Blank lines are
/// skipped and bare hostnames get an `http://` scheme.
pub fn load_seeds(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path)?;
    let mut seeds = Vec::new();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let seed = if line.contains("://") {
            line.to_string()
        } else {
            format!("http://{line}")
        };

        Url::parse(&seed).map_err(|e| CrawlError::InvalidSeed(format!("{seed}: {e}")))?;
        seeds.push(seed);
    }

    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_blank_lines_skipped_and_scheme_defaulted() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "http://a.onion\n\n  b.onion  \nhttps://c.onion/start\n"
        )
        .unwrap();

        let seeds = load_seeds(file.path()).unwrap();
        assert_eq!(
            seeds,
            vec![
                "http://a.onion".to_string(),
                "http://b.onion".to_string(),
                "https://c.onion/start".to_string(),
            ]
        );
    }

    #[test]
    fn test_unparseable_seed_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "http://[broken\n").unwrap();

        assert!(matches!(
            load_seeds(file.path()),
            Err(CrawlError::InvalidSeed(_))
        ));
    }
}
