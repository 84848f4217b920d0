//! A session store backed by files in a local directory

use std::{io, path::PathBuf};

use async_trait::async_trait;
use tokio::fs::OpenOptions;

use super::{storage_unavailable, SessionStore, StorageError};

/// A session store keeping one file per key inside a directory
#[derive(Debug)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    /// Constructs a new file session store rooted at `dir`
    ///
    /// The directory is created on first write.
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }

    async fn read_value(&self, key: &str) -> Result<Option<String>, io::Error> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn write_value(&self, key: &str, value: &str) -> Result<(), io::Error> {
        use tokio::io::AsyncWriteExt;

        tokio::fs::create_dir_all(&self.dir).await?;

        let mut file_opts = OpenOptions::new();

        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(self.path_for(key)).await?;
        file.write_all(value.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn remove_value(&self, key: &str) -> Result<(), io::Error> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.read_value(key).await.map_err(storage_unavailable)
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.write_value(key, value).await.map_err(storage_unavailable)
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.remove_value(key).await.map_err(storage_unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persists_across_store_instances() {
        let dir = tempfile::tempdir().unwrap();

        let store = FileSessionStore::new(dir.path().join("state"));
        store.save("ostiary.session", r#"{"a":1}"#).await.unwrap();

        let reopened = FileSessionStore::new(dir.path().join("state"));
        assert_eq!(
            reopened.load("ostiary.session").await.unwrap().as_deref(),
            Some(r#"{"a":1}"#)
        );

        reopened.remove("ostiary.session").await.unwrap();
        assert_eq!(store.load("ostiary.session").await.unwrap(), None);
    }

    #[tokio::test]
    async fn removing_a_missing_key_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().to_owned());

        store.remove("never-written").await.unwrap();
    }

    #[test]
    fn keys_are_sanitized_into_file_names() {
        let store = FileSessionStore::new(PathBuf::from("/tmp/ostiary"));
        assert_eq!(
            store.path_for("../etc/passwd"),
            PathBuf::from("/tmp/ostiary/.._etc_passwd.json")
        );
    }
}
