// src/config/stop_words.rs
//! Stop-word list files.
//!
//! Two formats are accepted: a TOML table `words = [...]` or a bare JSON
//! array of strings. Lookup order when no explicit path is configured:
//! `$STOP_WORDS_PATH`, `config/stop_words.toml`, `config/stop_words.json`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_STOP_WORDS_PATH: &str = "STOP_WORDS_PATH";

const FALLBACK_FILES: [&str; 2] = ["config/stop_words.toml", "config/stop_words.json"];

#[derive(Deserialize)]
struct WordTable {
    words: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListFormat {
    Toml,
    Json,
}

impl ListFormat {
    /// Extension decides; unknown extensions are sniffed from the first byte.
    fn detect(path: &Path, content: &str) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(e) if e.eq_ignore_ascii_case("json") => Self::Json,
            Some(e) if e.eq_ignore_ascii_case("toml") => Self::Toml,
            _ if content.trim_start().starts_with('[') => Self::Json,
            _ => Self::Toml,
        }
    }
}

pub fn load_stop_words_from(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading stop words from {}", path.display()))?;
    let words = match ListFormat::detect(path, &content) {
        ListFormat::Json => serde_json::from_str::<Vec<String>>(&content)
            .with_context(|| format!("stop words in {} are not a JSON string array", path.display()))?,
        ListFormat::Toml => toml::from_str::<WordTable>(&content)
            .with_context(|| format!("stop words in {} lack a `words` array", path.display()))?
            .words,
    };
    Ok(clean_list(words))
}

/// Stop words from the environment or the conventional files. No file is not an error.
pub fn load_stop_words_default() -> Result<Vec<String>> {
    if let Ok(p) = std::env::var(ENV_STOP_WORDS_PATH) {
        let path = PathBuf::from(&p);
        if !path.is_file() {
            bail!("{ENV_STOP_WORDS_PATH}={p} does not point to a file");
        }
        return load_stop_words_from(&path);
    }
    match FALLBACK_FILES.iter().map(Path::new).find(|p| p.is_file()) {
        Some(path) => load_stop_words_from(path),
        None => Ok(Vec::new()),
    }
}

/// Trim, drop blanks, de-duplicate case-insensitively. First spelling wins, order kept.
pub fn clean_list(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter_map(|w| {
            let w = w.trim();
            (!w.is_empty() && seen.insert(w.to_lowercase())).then(|| w.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn cleaning_keeps_first_spelling() {
        let out = clean_list(vec![
            " Автосалон ".into(),
            String::new(),
            "кредит".into(),
            "КРЕДИТ".into(),
        ]);
        assert_eq!(out, vec!["Автосалон", "кредит"]);
    }

    #[test]
    fn both_formats_load() {
        let dir = tempfile::tempdir().unwrap();
        let t = dir.path().join("words.toml");
        fs::write(&t, "words = [\"аренда\", \" посуточно \"]").unwrap();
        assert_eq!(load_stop_words_from(&t).unwrap(), vec!["аренда", "посуточно"]);

        let j = dir.path().join("words.list");
        fs::write(&j, "[\"лизинг\", \"лизинг\"]").unwrap();
        assert_eq!(load_stop_words_from(&j).unwrap(), vec!["лизинг"]);

        let bad = dir.path().join("words.json");
        fs::write(&bad, "{\"words\": 1}").unwrap();
        assert!(load_stop_words_from(&bad).is_err());
    }

    #[test]
    #[serial]
    fn env_path_must_exist() {
        std::env::set_var(ENV_STOP_WORDS_PATH, "/nonexistent/stop_words.toml");
        assert!(load_stop_words_default().is_err());

        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("sw.json");
        fs::write(&p, "[\"запчасти\"]").unwrap();
        std::env::set_var(ENV_STOP_WORDS_PATH, &p);
        assert_eq!(load_stop_words_default().unwrap(), vec!["запчасти"]);

        std::env::remove_var(ENV_STOP_WORDS_PATH);
    }
}
