//! JSON state-file helpers shared by every `*.state.json` owner.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Write `value` as pretty JSON, creating parent directories first.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text)?;
    tracing::debug!(path = %path.display(), "saved state");
    Ok(())
}

/// Read a state file if it exists. A missing file is `Ok(None)`; a file that
/// fails to parse is an error the caller decides how to handle.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&text)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        n: u32,
    }

    #[test]
    fn round_trips_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/sample.state.json");
        save_json(&path, &Sample { n: 7 }).unwrap();
        assert_eq!(load_json::<Sample>(&path).unwrap(), Some(Sample { n: 7 }));
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            load_json::<Sample>(&dir.path().join("gone.json")).unwrap(),
            None
        );
    }
}
