use std::path::{Path, PathBuf};

/// Class order of the bundled waste model.
pub const DEFAULT_LABELS: [&str; 3] = ["Plastic", "Paper", "Daily Disposals"];

pub fn default_labels() -> Vec<String> {
    DEFAULT_LABELS.iter().map(|s| s.to_string()).collect()
}

/// Finds `<model>.labels.txt`, then `labels.txt`, next to the model file.
pub fn resolve_labels_path(model_path: &Path) -> Option<PathBuf> {
    let labels_path = model_path.with_extension("labels.txt");
    if labels_path.exists() {
        return Some(labels_path);
    }
    let sibling = model_path
        .parent()
        .map(|dir| dir.join("labels.txt"))
        .unwrap_or_else(|| PathBuf::from("labels.txt"));
    if sibling.exists() {
        return Some(sibling);
    }
    None
}

/// Reads the sidecar label table for `model_path`. `None` when there is no
/// usable sidecar and the caller should keep its configured labels.
pub fn load_labels_for_model(model_path: &Path) -> Option<Vec<String>> {
    let labels_path = resolve_labels_path(model_path)?;
    let contents = match std::fs::read_to_string(&labels_path) {
        Ok(data) => data,
        Err(err) => {
            log::warn!(
                "Failed to read labels from {}: {}",
                labels_path.display(),
                err
            );
            return None;
        }
    };
    let labels = parse_labels(&contents);
    if labels.is_empty() {
        log::warn!(
            "Labels file is empty or invalid: {}",
            labels_path.display()
        );
        return None;
    }
    log::info!(
        "Loaded {} labels from {}",
        labels.len(),
        labels_path.display()
    );
    Some(labels)
}

pub fn parse_labels(contents: &str) -> Vec<String> {
    contents
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(normalize_label)
        .collect()
}

// Accepts "Paper", "1 Paper", "1: Paper" and quoted forms. Case is kept since
// labels are shown to the user verbatim.
fn normalize_label(line: &str) -> Option<String> {
    let mut label = line.trim();
    if label.is_empty() {
        return None;
    }
    if let Some((prefix, rest)) = label.split_once(':') {
        if !prefix.is_empty() && prefix.trim().chars().all(|c| c.is_ascii_digit()) {
            label = rest.trim();
        }
    } else {
        let mut parts = label.splitn(2, char::is_whitespace);
        let first = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("");
        if !first.is_empty() && first.chars().all(|c| c.is_ascii_digit()) && !rest.is_empty() {
            label = rest.trim();
        }
    }
    label = label.trim_matches('"').trim_matches('\'').trim();
    if label.is_empty() {
        return None;
    }
    Some(label.to_string())
}
