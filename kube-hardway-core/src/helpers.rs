use std::{any::type_name, path::Path};

use kube::Resource;
use tokio::io::AsyncWriteExt;

pub fn pretty_type_name<'a, T>() -> &'a str {
    type_name::<T>().rsplit("::").next().unwrap_or_default()
}

pub trait With<F> {
    fn with(self, op: F) -> Self;
}

impl<T, F> With<F> for T
where
    F: FnOnce(&mut Self),
{
    fn with(mut self, op: F) -> Self {
        op(&mut self);

        self
    }
}

pub trait RequireMetadata<E> {
    fn require_name_or_else(&self, error: impl FnOnce() -> E) -> Result<&str, E>;
}

impl<T: Resource, E> RequireMetadata<E> for T {
    fn require_name_or_else(&self, error: impl FnOnce() -> E) -> Result<&str, E> {
        Ok(self.meta().name.as_ref().ok_or_else(error)?.as_str())
    }
}

/// Replaces `path` with `contents`, readable as `mode` allows before the first byte lands.
pub async fn write_with_mode(path: &Path, contents: &str, mode: u32) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);

    #[cfg(unix)]
    options.mode(mode);

    let mut file = options.open(path).await?;

    // `mode` only applies on creation, an existing file keeps its old permissions otherwise
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        file.set_permissions(std::fs::Permissions::from_mode(mode)).await?;
    }

    file.write_all(contents.as_bytes()).await?;
    file.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use k8s_openapi::api::core::v1::Node;

    use super::{pretty_type_name, write_with_mode, RequireMetadata, With};

    #[test]
    fn pretty_type_name_strips_the_module_path() {
        assert_eq!(pretty_type_name::<Node>(), "Node");
    }

    #[test]
    fn with_mutates_in_place() {
        let path = PathBuf::from("/var/lib").with(|p| p.push("kube-hardway"));

        assert_eq!(path, PathBuf::from("/var/lib/kube-hardway"));
    }

    #[test]
    fn nameless_resource_is_reported() {
        let node = Node::default();

        assert_eq!(node.require_name_or_else(|| "nameless"), Err("nameless"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rewriting_a_world_readable_file_tightens_it() {
        use std::os::unix::fs::PermissionsExt;

        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("admin-key.pem");
        std::fs::write(&path, "old").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        write_with_mode(&path, "new", 0o600).await.unwrap();

        let metadata = std::fs::metadata(&path).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn new_file_is_created_with_the_requested_mode() {
        use std::os::unix::fs::PermissionsExt;

        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("ca.pem");

        write_with_mode(&path, "cert", 0o644).await.unwrap();

        let metadata = std::fs::metadata(&path).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o644);
    }
}
