//! Logical path derivation.
//!
//! Paths are the sole identity in the store; every one is a pure
//! function of the image id or repository coordinates, and no path ever
//! embeds client-supplied content beyond those opaque keys.

/// Repository coordinates (`namespace/name`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    /// Repository namespace (defaults to `library` for bare names).
    pub namespace: String,
    /// Repository name.
    pub name: String,
}

impl RepoRef {
    /// Parses `namespace/name`, applying the `library` default namespace
    /// to bare names. Returns `None` for empty or over-nested input.
    pub fn parse(full_name: &str) -> Option<Self> {
        let mut parts = full_name.split('/');
        let first = parts.next()?;
        if first.is_empty() {
            return None;
        }
        match (parts.next(), parts.next()) {
            (None, _) => Some(Self {
                namespace: "library".to_owned(),
                name: first.to_owned(),
            }),
            (Some(name), None) if !name.is_empty() => Some(Self {
                namespace: first.to_owned(),
                name: name.to_owned(),
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Path of the raw image manifest JSON.
pub fn image_json_path(image_id: &str) -> String {
    format!("images/{image_id}/json")
}

/// Path of the layer archive bytes.
pub fn image_layer_path(image_id: &str) -> String {
    format!("images/{image_id}/layer")
}

/// Path of the stored `<algorithm>:<hexdigest>` checksum.
pub fn image_checksum_path(image_id: &str) -> String {
    format!("images/{image_id}/_checksum")
}

/// Path of the JSON ancestry list.
pub fn image_ancestry_path(image_id: &str) -> String {
    format!("images/{image_id}/ancestry")
}

/// Path of the cached JSON files inventory.
pub fn image_files_path(image_id: &str) -> String {
    format!("images/{image_id}/_files")
}

/// Path of the cached JSON diff result.
pub fn image_diff_path(image_id: &str) -> String {
    format!("images/{image_id}/_diff")
}

/// Path of the upload mark. Its existence means "upload in progress".
pub fn image_mark_path(image_id: &str) -> String {
    format!("images/{image_id}/_inprogress")
}

/// Path of a repository's JSON images list.
pub fn images_list_path(repo: &RepoRef) -> String {
    format!("repositories/{}/{}/_images_list", repo.namespace, repo.name)
}

/// Path of a repository's privacy flag.
pub fn private_flag_path(repo: &RepoRef) -> String {
    format!("repositories/{}/{}/_private", repo.namespace, repo.name)
}
