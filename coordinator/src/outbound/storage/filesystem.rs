//! Storage nodes served from locally mounted directories.
//!
//! Each configured `(virtual storage, storage)` pair maps to a root directory
//! holding bare repositories named `*.git`. Directory access goes through
//! `cap_std`, so relative paths cannot escape their storage root. Filesystem
//! work runs on blocking tasks.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use cap_std::{ambient_authority, fs::Dir};
use futures_util::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::domain::ports::{
    BackendError, ChecksumSource, NodeDialer, RepositoryPaths, RepositoryWalker,
};

/// Checksum reported for a repository without references.
pub const EMPTY_CHECKSUM: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const REPOSITORY_SUFFIX: &str = ".git";

/// Storage roots keyed by virtual storage and storage name.
#[derive(Debug, Clone, Default)]
pub struct FilesystemStorages {
    roots: Arc<BTreeMap<(String, String), PathBuf>>,
}

impl FilesystemStorages {
    /// Build from `(virtual storage, storage, root)` triples.
    pub fn new<I>(roots: I) -> Self
    where
        I: IntoIterator<Item = (String, String, PathBuf)>,
    {
        Self {
            roots: Arc::new(
                roots
                    .into_iter()
                    .map(|(virtual_storage, storage, root)| ((virtual_storage, storage), root))
                    .collect(),
            ),
        }
    }

    fn root(&self, virtual_storage: &str, storage: &str) -> Result<PathBuf, BackendError> {
        self.roots
            .get(&(virtual_storage.to_owned(), storage.to_owned()))
            .cloned()
            .ok_or_else(|| {
                BackendError::unavailable(
                    storage,
                    format!("storage is not configured for virtual storage {virtual_storage}"),
                )
            })
    }
}

fn open_root(storage: &str, root: &Path) -> Result<Dir, BackendError> {
    Dir::open_ambient_dir(root, ambient_authority())
        .map_err(|err| BackendError::unavailable(storage, format!("{}: {err}", root.display())))
}

async fn run_blocking<T, F>(storage: &str, work: F) -> Result<T, BackendError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BackendError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| BackendError::rpc(storage, format!("filesystem task failed: {err}")))?
}

/// Collect repository paths below `dir`, prefixing them with `prefix`.
fn collect_repositories(dir: &Dir, prefix: &str, found: &mut Vec<String>) -> io::Result<()> {
    let mut children = Vec::new();
    for entry in dir.entries()? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        children.push(name);
    }
    children.sort();

    for name in children {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        if name.ends_with(REPOSITORY_SUFFIX) {
            found.push(path);
        } else {
            collect_repositories(&dir.open_dir(&name)?, &path, found)?;
        }
    }
    Ok(())
}

/// Loose reference files below `dir`, as `(path, contents)` pairs.
fn collect_loose_refs(
    dir: &Dir,
    prefix: &str,
    found: &mut Vec<(String, Vec<u8>)>,
) -> io::Result<()> {
    for entry in dir.entries()? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let path = format!("{prefix}/{name}");
        if entry.file_type()?.is_dir() {
            collect_loose_refs(&dir.open_dir(&name)?, &path, found)?;
        } else {
            found.push((path, dir.read(&name)?));
        }
    }
    Ok(())
}

/// SHA-256 over `packed-refs` and every loose ref, in path order.
fn repository_checksum(repository: &Dir) -> io::Result<String> {
    let mut refs = Vec::new();
    match repository.read("packed-refs") {
        Ok(contents) => refs.push(("packed-refs".to_owned(), contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    match repository.open_dir("refs") {
        Ok(dir) => collect_loose_refs(&dir, "refs", &mut refs)?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    if refs.is_empty() {
        return Ok(EMPTY_CHECKSUM.to_owned());
    }
    refs.sort_by(|left, right| left.0.cmp(&right.0));

    let mut hasher = Sha256::new();
    for (path, contents) in &refs {
        hasher.update(path.as_bytes());
        hasher.update([0]);
        hasher.update(contents);
        hasher.update([0]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[async_trait]
impl RepositoryWalker for FilesystemStorages {
    async fn walk_repos(
        &self,
        virtual_storage: &str,
        storage: &str,
    ) -> Result<RepositoryPaths, BackendError> {
        let root = self.root(virtual_storage, storage)?;
        let name = storage.to_owned();
        let paths = run_blocking(storage, move || {
            let dir = open_root(&name, &root)?;
            let mut found = Vec::new();
            collect_repositories(&dir, "", &mut found)
                .map_err(|err| BackendError::rpc(&name, format!("walk: {err}")))?;
            Ok(found)
        })
        .await?;

        debug!(virtual_storage, storage, count = paths.len(), "storage walked");
        Ok(stream::iter(paths.into_iter().map(Ok)).boxed())
    }
}

#[async_trait]
impl ChecksumSource for FilesystemStorages {
    async fn checksum(
        &self,
        virtual_storage: &str,
        storage: &str,
        relative_path: &str,
    ) -> Result<String, BackendError> {
        let root = self.root(virtual_storage, storage)?;
        let name = storage.to_owned();
        let path = relative_path.to_owned();
        run_blocking(storage, move || {
            let dir = open_root(&name, &root)?;
            let repository = match dir.open_dir(&path) {
                Ok(repository) => repository,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Err(BackendError::not_found(&name, &path));
                }
                Err(err) => return Err(BackendError::rpc(&name, format!("{path}: {err}"))),
            };
            repository_checksum(&repository)
                .map_err(|err| BackendError::rpc(&name, format!("{path}: {err}")))
        })
        .await
    }
}

#[async_trait]
impl NodeDialer for FilesystemStorages {
    async fn dial(&self, virtual_storage: &str, storage: &str) -> Result<(), BackendError> {
        let root = self.root(virtual_storage, storage)?;
        let name = storage.to_owned();
        run_blocking(storage, move || open_root(&name, &root).map(|_| ())).await
    }
}
