//! Snapshot file-selection manifest: which remote files to fetch and
//! which ones must be present afterward.

/// Default glob set and required-file list for a model snapshot.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub globs: Vec<String>,
    pub required_files: Vec<String>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            globs: ["*.json", "*.safetensors", "*.txt", "*.model", "*.tiktoken", "*.jinja"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            required_files: vec!["config.json".to_string()],
        }
    }
}

impl Manifest {
    pub fn matches(&self, filename: &str) -> bool {
        self.globs.iter().any(|pattern| glob_match(pattern, filename))
    }
}

/// Minimal `*`-wildcard matcher sufficient for the manifest's
/// extension-style globs; no `?` or character-class support since the
/// manifest never needs them.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let mut pos = 0usize;
    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !text[pos..].starts_with(part) {
                return false;
            }
            pos += part.len();
        } else if i == last {
            return text.len() >= pos && text[pos..].ends_with(part);
        } else {
            match text[pos..].find(part) {
                Some(offset) => pos += offset + part.len(),
                None => return false,
            }
        }
    }
    true
}

pub fn has_safetensors(files: &[String]) -> bool {
    files.iter().any(|f| f.ends_with(".safetensors"))
}

pub fn missing_required<'a>(required: &'a [String], files: &[String]) -> Vec<&'a str> {
    required.iter().filter(|r| !files.iter().any(|f| f == *r)).map(|s| s.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_manifest_matches_expected_extensions() {
        let manifest = Manifest::default();
        assert!(manifest.matches("config.json"));
        assert!(manifest.matches("model.safetensors"));
        assert!(manifest.matches("vocab.txt"));
        assert!(manifest.matches("tokenizer.model"));
        assert!(manifest.matches("merges.tiktoken"));
        assert!(manifest.matches("chat_template.jinja"));
        assert!(!manifest.matches("README.md"));
    }

    #[test]
    fn has_safetensors_detects_presence() {
        assert!(has_safetensors(&["a.json".to_string(), "b.safetensors".to_string()]));
        assert!(!has_safetensors(&["a.json".to_string()]));
    }

    #[test]
    fn missing_required_lists_absent_files() {
        let required = vec!["config.json".to_string(), "tokenizer.json".to_string()];
        let files = vec!["config.json".to_string()];
        assert_eq!(missing_required(&required, &files), vec!["tokenizer.json"]);
    }
}
