use anyhow::Result;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Save image data into a content-addressed store and return its hash id.
pub async fn save_object<P: AsRef<Path>>(base: P, data: Bytes) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(&data);
    let hash = format!("{:x}", hasher.finalize());
    let sub = &hash[..2];
    let dir = base.as_ref().join(sub);
    fs::create_dir_all(&dir).await?;
    let path = dir.join(&hash);
    fs::write(path, data).await?;
    Ok(hash)
}

/// Determine the on-disk path for an object id within the store.
pub fn object_path<P: AsRef<Path>>(base: P, id: &str) -> Option<PathBuf> {
    if id.len() < 3 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let sub = &id[..2];
    Some(base.as_ref().join(sub).join(id))
}

/// Remove an object. Missing objects are ignored.
pub async fn delete_object<P: AsRef<Path>>(base: P, id: &str) -> Result<()> {
    if let Some(path) = object_path(base, id) {
        match fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Extract the object id from a media URL of the form `/api/media/<id>`.
pub fn id_from_media_url(url: &str) -> Option<&str> {
    url.strip_prefix("/api/media/")
}

pub fn media_url(id: &str) -> String {
    format!("/api/media/{id}")
}
