use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Final product of one generation: the remote image plus the text that
/// produced it. No image bytes are kept locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artwork {
    pub image_url: String,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub backend: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub prompt_path: PathBuf,
    pub image_path: PathBuf,
    pub metadata_path: PathBuf,
}

/// Writes `<name>-prompt.txt`, `<name>-image.txt` and `<name>-metadata.json`
/// into `dir`.
pub fn write_artifacts(dir: &Path, name: &str, artwork: &Artwork) -> anyhow::Result<ArtifactPaths> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let stem = artifact_stem(name);
    let paths = ArtifactPaths {
        prompt_path: dir.join(format!("{stem}-prompt.txt")),
        image_path: dir.join(format!("{stem}-image.txt")),
        metadata_path: dir.join(format!("{stem}-metadata.json")),
    };

    let mut prompt_text = artwork.prompt.clone();
    if let Some(negative) = artwork.negative_prompt.as_deref() {
        prompt_text.push_str("\n\nNegative prompt: ");
        prompt_text.push_str(negative);
    }
    prompt_text.push('\n');
    std::fs::write(&paths.prompt_path, prompt_text)
        .with_context(|| format!("failed to write {}", paths.prompt_path.display()))?;
    std::fs::write(&paths.image_path, format!("{}\n", artwork.image_url))
        .with_context(|| format!("failed to write {}", paths.image_path.display()))?;

    let mut metadata = artwork.metadata.clone();
    metadata.insert("name".to_string(), Value::String(stem.clone()));
    metadata.insert(
        "image_url".to_string(),
        Value::String(artwork.image_url.clone()),
    );
    metadata.insert("backend".to_string(), Value::String(artwork.backend.clone()));
    metadata.insert(
        "created_at".to_string(),
        Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    std::fs::write(
        &paths.metadata_path,
        serde_json::to_string_pretty(&Value::Object(metadata))?,
    )
    .with_context(|| format!("failed to write {}", paths.metadata_path.display()))?;

    Ok(paths)
}

/// Lowercase, dash-separated file stem. Falls back to `artwork`.
pub fn artifact_stem(name: &str) -> String {
    let mut stem = String::new();
    let mut pending_dash = false;
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !stem.is_empty() {
                stem.push('-');
            }
            stem.push(ch.to_ascii_lowercase());
            pending_dash = false;
        } else {
            pending_dash = true;
        }
    }
    if stem.is_empty() {
        return "artwork".to_string();
    }
    stem.chars().take(64).collect::<String>().trim_end_matches('-').to_string()
}
