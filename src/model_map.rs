use crate::config::ModelMapEntry;
use std::collections::HashMap;

/// Read-only logical → upstream model table. Built once at startup; lookups
/// never fail and fall back to the requested name.
#[derive(Debug, Clone, Default)]
pub struct ModelMapper {
    table: HashMap<String, String>,
}

impl ModelMapper {
    /// Later entries win, so overrides can be appended after the defaults.
    pub fn new(entries: impl IntoIterator<Item = ModelMapEntry>) -> Self {
        let table = entries
            .into_iter()
            .map(|entry| (entry.logical_model, entry.upstream_model))
            .collect();
        Self { table }
    }

    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        self.table.get(name).map(String::as_str).unwrap_or(name)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::ModelMapper;
    use crate::config::{ModelMapEntry, builtin_model_map};

    #[test]
    fn mapped_name_resolves_to_table_value() {
        let mapper = ModelMapper::new(builtin_model_map());
        assert_eq!(mapper.resolve("gpt-4o"), "meta/llama3.1-8b");
        assert_eq!(mapper.resolve("gpt-4o-mini"), "openai/gpt-4o-mini");
    }

    #[test]
    fn unmapped_name_falls_back_to_identity() {
        let mapper = ModelMapper::new(builtin_model_map());
        assert_eq!(mapper.resolve("meta/llama3.1-8b"), "meta/llama3.1-8b");
        assert_eq!(mapper.resolve(""), "");
        assert_eq!(mapper.resolve("GPT-4O"), "GPT-4O");
    }

    #[test]
    fn later_entries_override_earlier_ones() {
        let mut entries = builtin_model_map();
        entries.push(ModelMapEntry {
            logical_model: "gpt-4o".to_string(),
            upstream_model: "openai/gpt-4o".to_string(),
        });
        let mapper = ModelMapper::new(entries);
        assert_eq!(mapper.resolve("gpt-4o"), "openai/gpt-4o");
        assert_eq!(mapper.len(), 5);
    }
}
