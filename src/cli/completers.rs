use std::path::Path;

use clap_complete::engine::CompletionCandidate;

use crate::config::{MANIFEST_FILE, Project};

/// Package names from the manifest in the current directory.
pub fn complete_packages() -> Vec<CompletionCandidate> {
    package_candidates(Path::new(MANIFEST_FILE))
}

fn package_candidates(manifest: &Path) -> Vec<CompletionCandidate> {
    let Ok(project) = Project::load(manifest) else {
        return Vec::new();
    };
    project
        .manifest
        .packages
        .iter()
        .map(|(name, entry)| CompletionCandidate::new(name).help(Some(entry.url.clone().into())))
        .collect()
}
