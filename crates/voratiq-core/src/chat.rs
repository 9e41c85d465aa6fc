//! Bundles each provider's conversation transcript out of the sandbox tree
//! before teardown, into `artifacts/chat.jsonl` or `artifacts/chat.json`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptFormat {
    Jsonl,
    Json,
}

/// Where a provider writes transcripts inside the sandbox tree, relative to
/// the sandbox home.
struct ProviderTranscripts {
    format: TranscriptFormat,
    root: &'static str,
    extension: &'static str,
}

fn transcripts_for(provider: &str) -> Option<ProviderTranscripts> {
    match provider {
        "claude" => Some(ProviderTranscripts {
            format: TranscriptFormat::Jsonl,
            root: ".claude/projects",
            extension: "jsonl",
        }),
        "codex" => Some(ProviderTranscripts {
            format: TranscriptFormat::Jsonl,
            root: ".codex/sessions",
            extension: "jsonl",
        }),
        "gemini" => Some(ProviderTranscripts {
            format: TranscriptFormat::Json,
            root: ".gemini/tmp",
            extension: "json",
        }),
        _ => None,
    }
}

fn find_transcripts(root: &Path, extension: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    walk(root, extension, &mut found);
    found.sort();
    found
}

fn walk(dir: &Path, extension: &str, found: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, extension, found);
        } else if path.extension().and_then(|e| e.to_str()) == Some(extension) {
            found.push(path);
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonTranscriptEntry {
    source_path: String,
    payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct JsonChatBundle {
    provider: String,
    transcripts: Vec<JsonTranscriptEntry>,
}

/// Outcome of [`preserve`]: `NotFound` when the provider writes no
/// transcripts for this sandbox; `Preserved` otherwise, with an optional
/// warning to attach to the agent's record.
pub enum ChatOutcome {
    NotFound,
    Preserved { warning: Option<String> },
}

/// Copy/bundle `provider`'s transcripts found under `sandbox_home` into
/// `artifacts/chat.{jsonl,json}`. Called on both success and failure paths,
/// before sandbox teardown.
pub fn preserve(provider: &str, sandbox_home: &Path, artifacts_dir: &Path) -> Result<ChatOutcome> {
    let Some(spec) = transcripts_for(provider) else {
        return Ok(ChatOutcome::NotFound);
    };
    let search_root = sandbox_home.join(spec.root);
    if !search_root.exists() {
        return Ok(ChatOutcome::NotFound);
    }

    let sources = find_transcripts(&search_root, spec.extension);
    if sources.is_empty() {
        return Ok(ChatOutcome::NotFound);
    }

    match spec.format {
        TranscriptFormat::Jsonl => preserve_jsonl(&sources, artifacts_dir),
        TranscriptFormat::Json => preserve_json(provider, sandbox_home, &sources, artifacts_dir),
    }
}

fn preserve_jsonl(sources: &[PathBuf], artifacts_dir: &Path) -> Result<ChatOutcome> {
    let destination = artifacts_dir.join("chat.jsonl");
    let mut bundled = String::new();
    let mut warning = None;
    for source in sources {
        match fs::read_to_string(source) {
            Ok(content) => {
                bundled.push_str(content.trim_end());
                bundled.push('\n');
            }
            Err(e) => {
                warning = Some(format!(
                    "failed to read transcript {}: {e}",
                    source.display()
                ));
            }
        }
    }
    fs::write(&destination, bundled)
        .with_context(|| format!("failed to write {}", destination.display()))?;
    Ok(ChatOutcome::Preserved { warning })
}

/// Multiple sources for a `json`-format provider are all included in the
/// bundle's `transcripts` array; this is preservation success, not a warning.
fn preserve_json(
    provider: &str,
    sandbox_home: &Path,
    sources: &[PathBuf],
    artifacts_dir: &Path,
) -> Result<ChatOutcome> {
    let destination = artifacts_dir.join("chat.json");
    let mut transcripts = Vec::new();
    let mut warning = None;
    for source in sources {
        let repo_relative = source
            .strip_prefix(sandbox_home)
            .unwrap_or(source)
            .to_string_lossy()
            .into_owned();
        match fs::read_to_string(source) {
            Ok(content) => match serde_json::from_str::<serde_json::Value>(&content) {
                Ok(payload) => transcripts.push(JsonTranscriptEntry {
                    source_path: repo_relative,
                    payload,
                }),
                Err(e) => {
                    warning = Some(format!("failed to parse transcript {repo_relative}: {e}"));
                }
            },
            Err(e) => {
                warning = Some(format!("failed to read transcript {repo_relative}: {e}"));
            }
        }
    }

    let bundle = JsonChatBundle {
        provider: provider.to_string(),
        transcripts,
    };
    let json = serde_json::to_string_pretty(&bundle).context("failed to serialize chat bundle")?;
    fs::write(&destination, json)
        .with_context(|| format!("failed to write {}", destination.display()))?;
    Ok(ChatOutcome::Preserved { warning })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn preserve_returns_not_found_for_unknown_provider() {
        let td = tempdir().expect("tempdir");
        let outcome = preserve("unknown", td.path(), td.path()).expect("preserve");
        assert!(matches!(outcome, ChatOutcome::NotFound));
    }

    #[test]
    fn preserve_returns_not_found_when_no_transcripts_exist() {
        let td = tempdir().expect("tempdir");
        let outcome = preserve("claude", td.path(), td.path()).expect("preserve");
        assert!(matches!(outcome, ChatOutcome::NotFound));
    }

    #[test]
    fn preserve_bundles_jsonl_transcripts_concatenated() {
        let td = tempdir().expect("tempdir");
        let sandbox = td.path().join("sandbox");
        let project_dir = sandbox.join(".claude/projects/foo");
        fs::create_dir_all(&project_dir).expect("mkdir");
        fs::write(project_dir.join("a.jsonl"), "{\"role\":\"user\"}\n").expect("write");
        fs::write(project_dir.join("b.jsonl"), "{\"role\":\"assistant\"}\n").expect("write");

        let artifacts = td.path().join("artifacts");
        fs::create_dir_all(&artifacts).expect("mkdir");

        let outcome = preserve("claude", &sandbox, &artifacts).expect("preserve");
        assert!(matches!(outcome, ChatOutcome::Preserved { warning: None }));
        let bundled = fs::read_to_string(artifacts.join("chat.jsonl")).expect("read");
        assert!(bundled.contains("user"));
        assert!(bundled.contains("assistant"));
    }

    #[test]
    fn preserve_bundles_multiple_json_sources_without_warning() {
        let td = tempdir().expect("tempdir");
        let sandbox = td.path().join("sandbox");
        let chats_dir = sandbox.join(".gemini/tmp/abc123/chats");
        fs::create_dir_all(&chats_dir).expect("mkdir");
        fs::write(chats_dir.join("1.json"), r#"{"turn":1}"#).expect("write");
        fs::write(chats_dir.join("2.json"), r#"{"turn":2}"#).expect("write");

        let artifacts = td.path().join("artifacts");
        fs::create_dir_all(&artifacts).expect("mkdir");

        let outcome = preserve("gemini", &sandbox, &artifacts).expect("preserve");
        assert!(matches!(outcome, ChatOutcome::Preserved { warning: None }));
        let content = fs::read_to_string(artifacts.join("chat.json")).expect("read");
        let parsed: serde_json::Value = serde_json::from_str(&content).expect("valid json");
        assert_eq!(parsed["transcripts"].as_array().unwrap().len(), 2);
    }
}
