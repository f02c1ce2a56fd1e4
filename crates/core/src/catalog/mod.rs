//! The core's abstraction over the metadata store: a directory tree of
//! files, each backed by an ordered list of attachment nodes. Boxed futures
//! keep the trait object-safe, so a `Box<dyn Catalog>` can be handed around
//! without generics leaking into every caller.

mod memory;
mod sqlite;

use std::future::Future;
use std::pin::Pin;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

pub use memory::InMemoryCatalog;
pub use sqlite::SqliteCatalog;

use crate::{Error, Result};

pub type FileId = uuid::Uuid;

/// The well-known id of the root directory entity. Any mutation targeting
/// it returns `Permission`.
pub const ROOT_ID: FileId = uuid::Uuid::nil();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub id: FileId,
    pub name: String,
    pub parent_id: Option<FileId>,
    pub is_directory: bool,
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

/// A persisted catalog row for one Attachment bound to one file. `iv` is
/// reserved for a future encryption layer; this core never populates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub file_id: FileId,
    pub url: String,
    pub size: u64,
    pub index: u32,
    pub iv: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdatePatch {
    pub name: Option<String>,
    pub parent_id: Option<FileId>,
}

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_]$|^[A-Za-z0-9_][A-Za-z0-9_. -]*[A-Za-z0-9_]$")
        .expect("static name regex is valid")
});

pub fn validate_name(name: &str) -> Result<()> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidName {
            name: name.to_string(),
        })
    }
}

/// Splits a `/`-delimited path into its non-empty segments. `"/"` and `""`
/// both resolve to the root (zero segments).
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Object-safe catalog contract. Path-based operations resolve through the
/// directory tree starting at `ROOT_ID`; id-based operations take an
/// optional `parent_hint` purely as a cheap consistency check (when
/// present, it must match the record's actual parent or the call fails with
/// `InvalidParent`).
pub trait Catalog: Send + Sync {
    fn stat<'a>(&'a self, path: &'a str) -> BoxFuture<'a, File>;
    fn get<'a>(&'a self, id: FileId, parent_hint: Option<FileId>) -> BoxFuture<'a, File>;
    fn ls<'a>(&'a self, path: &'a str, limit: usize, offset: usize) -> BoxFuture<'a, Vec<File>>;
    fn get_children<'a>(&'a self, parent_id: FileId) -> BoxFuture<'a, Vec<File>>;

    fn touch<'a>(&'a self, path: &'a str) -> BoxFuture<'a, File>;
    fn mkdir<'a>(&'a self, path: &'a str) -> BoxFuture<'a, File>;
    fn rm<'a>(&'a self, path: &'a str) -> BoxFuture<'a, ()>;
    fn mv<'a>(&'a self, src: &'a str, dst: &'a str) -> BoxFuture<'a, ()>;
    fn chmtime<'a>(&'a self, path: &'a str, t: DateTime<Utc>) -> BoxFuture<'a, ()>;
    fn create<'a>(
        &'a self,
        name: &'a str,
        parent_id: FileId,
        is_dir: bool,
    ) -> BoxFuture<'a, File>;
    fn update<'a>(
        &'a self,
        id: FileId,
        parent_hint: Option<FileId>,
        patch: UpdatePatch,
    ) -> BoxFuture<'a, File>;
    fn delete<'a>(&'a self, id: FileId, parent_hint: Option<FileId>) -> BoxFuture<'a, ()>;

    fn get_nodes<'a>(&'a self, file_id: FileId) -> BoxFuture<'a, Vec<Node>>;
    fn add_nodes<'a>(&'a self, file_id: FileId, nodes: Vec<Node>) -> BoxFuture<'a, ()>;
    fn delete_nodes<'a>(&'a self, file_id: FileId) -> BoxFuture<'a, ()>;
}
