use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_UPSTREAM_URL: &str = "https://app.chathub.gg/api/v3/chat/completions";
pub const DEFAULT_COOKIE_PATH: &str = "data/cookie.txt";
pub const DEFAULT_DEVICE_ID: &str = "db043b73-ee1b-49f0-a0f1-5f709d87c06d";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelMapEntry {
    pub logical_model: String,
    pub upstream_model: String,
}

impl ModelMapEntry {
    fn new(logical_model: &str, upstream_model: &str) -> Self {
        Self {
            logical_model: logical_model.to_string(),
            upstream_model: upstream_model.to_string(),
        }
    }
}

pub fn builtin_model_map() -> Vec<ModelMapEntry> {
    vec![
        ModelMapEntry::new("gpt-3.5-turbo", "meta/llama3.1-8b"),
        ModelMapEntry::new("gpt-3.5-turbo-16k", "meta/llama3.1-8b"),
        ModelMapEntry::new("gpt-4o", "meta/llama3.1-8b"),
        ModelMapEntry::new("gpt-4-32k", "meta/llama3.1-8b"),
        ModelMapEntry::new("gpt-4o-mini", "openai/gpt-4o-mini"),
    ]
}

/// Reads a JSON array of `{logical_model, upstream_model}` entries.
pub fn load_model_map_file(path: &Path) -> Result<Vec<ModelMapEntry>, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| format!("read {}: {}", path.display(), err))?;
    serde_json::from_str(&raw).map_err(|err| format!("parse {}: {}", path.display(), err))
}

#[cfg(test)]
mod tests {
    use super::{builtin_model_map, load_model_map_file};
    use std::io::Write;

    #[test]
    fn builtin_table_routes_gpt_aliases() {
        let map = builtin_model_map();
        let mini = map
            .iter()
            .find(|e| e.logical_model == "gpt-4o-mini")
            .unwrap();
        assert_eq!(mini.upstream_model, "openai/gpt-4o-mini");
        assert_eq!(map.len(), 5);
    }

    #[test]
    fn model_map_file_rejects_unknown_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"logical_model":"a","upstream_model":"b","weight":1}}]"#
        )
        .unwrap();
        assert!(load_model_map_file(file.path()).is_err());
    }

    #[test]
    fn model_map_file_parses_entries() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"logical_model":"claude-3","upstream_model":"anthropic/claude-3"}}]"#
        )
        .unwrap();
        let entries = load_model_map_file(file.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].upstream_model, "anthropic/claude-3");
    }
}
