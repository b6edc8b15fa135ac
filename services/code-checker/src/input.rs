use std::path::Path;

use crate::error::{Error, Result};

/// Read one code per line, skipping blank lines and `#` comments.
pub fn read_codes(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path).map_err(|source| Error::CodesFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_codes(&contents))
}

pub fn parse_codes(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect()
}
