use std::collections::HashMap;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{validate_name, split_path, Catalog, File, FileId, Node, UpdatePatch, ROOT_ID};
use crate::{Error, Result};

struct Inner {
    files: HashMap<FileId, File>,
    nodes: HashMap<FileId, Vec<Node>>,
}

impl Inner {
    fn new() -> Self {
        let mut files = HashMap::new();
        files.insert(
            ROOT_ID,
            File {
                id: ROOT_ID,
                name: String::new(),
                parent_id: None,
                is_directory: true,
                size: 0,
                mtime: Utc::now(),
            },
        );
        Self {
            files,
            nodes: HashMap::new(),
        }
    }

    fn child(&self, parent_id: FileId, name: &str) -> Option<&File> {
        self.files
            .values()
            .find(|f| f.parent_id == Some(parent_id) && f.name == name)
    }

    fn resolve(&self, path: &str) -> Result<FileId> {
        let mut current = ROOT_ID;
        for segment in split_path(path) {
            let parent = self.files.get(&current).expect("dangling parent id");
            if !parent.is_directory {
                return Err(Error::InvalidParent {
                    message: format!("{} is not a directory", parent.name),
                });
            }
            current = self
                .child(current, segment)
                .ok_or_else(|| Error::NotExist {
                    path: path.to_string(),
                })?
                .id;
        }
        Ok(current)
    }

    fn parent_of(&self, path: &str) -> Result<(FileId, String)> {
        let segments = split_path(path);
        let Some((name, parent_segments)) = segments.split_last() else {
            return Err(Error::InvalidParent {
                message: "path has no parent".to_string(),
            });
        };
        validate_name(name)?;
        let parent_path = parent_segments.join("/");
        let parent_id = self.resolve(&parent_path)?;
        Ok((parent_id, (*name).to_string()))
    }

    fn create(&mut self, name: String, parent_id: FileId, is_dir: bool) -> Result<File> {
        validate_name(&name)?;
        let parent = self
            .files
            .get(&parent_id)
            .ok_or_else(|| Error::InvalidParent {
                message: format!("parent {parent_id} does not exist"),
            })?;
        if !parent.is_directory {
            return Err(Error::InvalidParent {
                message: format!("{} is not a directory", parent.name),
            });
        }
        if self.child(parent_id, &name).is_some() {
            return Err(Error::Exist { name });
        }
        let file = File {
            id: FileId::new_v4(),
            name,
            parent_id: Some(parent_id),
            is_directory: is_dir,
            size: 0,
            mtime: Utc::now(),
        };
        self.files.insert(file.id, file.clone());
        Ok(file)
    }

    fn require_not_root(&self, id: FileId) -> Result<()> {
        if id == ROOT_ID {
            return Err(Error::Permission {
                message: "root entity cannot be mutated".to_string(),
            });
        }
        Ok(())
    }

    fn check_parent_hint(&self, file: &File, parent_hint: Option<FileId>) -> Result<()> {
        if let Some(hint) = parent_hint {
            if file.parent_id != Some(hint) {
                return Err(Error::InvalidParent {
                    message: format!("{} is not a child of {hint}", file.id),
                });
            }
        }
        Ok(())
    }
}

/// Reference catalog backend: an in-process map holding the directory tree
/// and each file's node list. Useful as a test double and for callers that
/// don't need persistence across restarts.
pub struct InMemoryCatalog {
    inner: Mutex<Inner>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
        }
    }
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog for InMemoryCatalog {
    fn stat<'a>(&'a self, path: &'a str) -> Pin<Box<dyn std::future::Future<Output = Result<File>> + Send + 'a>> {
        Box::pin(async move {
            let inner = self.inner.lock().await;
            let id = inner.resolve(path)?;
            Ok(inner.files.get(&id).expect("resolve returns a live id").clone())
        })
    }

    fn get<'a>(
        &'a self,
        id: FileId,
        parent_hint: Option<FileId>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<File>> + Send + 'a>> {
        Box::pin(async move {
            let inner = self.inner.lock().await;
            let file = inner.files.get(&id).ok_or_else(|| Error::NotExist {
                path: id.to_string(),
            })?;
            inner.check_parent_hint(file, parent_hint)?;
            Ok(file.clone())
        })
    }

    fn ls<'a>(
        &'a self,
        path: &'a str,
        limit: usize,
        offset: usize,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<File>>> + Send + 'a>> {
        Box::pin(async move {
            let inner = self.inner.lock().await;
            let id = inner.resolve(path)?;
            let mut children: Vec<File> = inner
                .files
                .values()
                .filter(|f| f.parent_id == Some(id))
                .cloned()
                .collect();
            children.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(children.into_iter().skip(offset).take(limit).collect())
        })
    }

    fn get_children<'a>(
        &'a self,
        parent_id: FileId,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<File>>> + Send + 'a>> {
        Box::pin(async move {
            let inner = self.inner.lock().await;
            let mut children: Vec<File> = inner
                .files
                .values()
                .filter(|f| f.parent_id == Some(parent_id))
                .cloned()
                .collect();
            children.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(children)
        })
    }

    fn touch<'a>(&'a self, path: &'a str) -> Pin<Box<dyn std::future::Future<Output = Result<File>> + Send + 'a>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            if let Ok(id) = inner.resolve(path) {
                let file = inner.files.get_mut(&id).expect("resolve returns a live id");
                file.mtime = Utc::now();
                return Ok(file.clone());
            }
            let (parent_id, name) = inner.parent_of(path)?;
            inner.create(name, parent_id, false)
        })
    }

    fn mkdir<'a>(&'a self, path: &'a str) -> Pin<Box<dyn std::future::Future<Output = Result<File>> + Send + 'a>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let (parent_id, name) = inner.parent_of(path)?;
            inner.create(name, parent_id, true)
        })
    }

    fn rm<'a>(&'a self, path: &'a str) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let id = inner.resolve(path)?;
            inner.require_not_root(id)?;

            let mut stack = vec![id];
            let mut doomed = Vec::new();
            while let Some(current) = stack.pop() {
                doomed.push(current);
                for child in inner.files.values().filter(|f| f.parent_id == Some(current)) {
                    stack.push(child.id);
                }
            }
            for doomed_id in doomed {
                inner.files.remove(&doomed_id);
                inner.nodes.remove(&doomed_id);
            }
            Ok(())
        })
    }

    fn mv<'a>(&'a self, src: &'a str, dst: &'a str) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let id = inner.resolve(src)?;
            inner.require_not_root(id)?;
            let (new_parent, new_name) = inner.parent_of(dst)?;
            if inner.child(new_parent, &new_name).is_some() {
                return Err(Error::Exist { name: new_name });
            }
            let file = inner.files.get_mut(&id).expect("resolve returns a live id");
            file.parent_id = Some(new_parent);
            file.name = new_name;
            file.mtime = Utc::now();
            Ok(())
        })
    }

    fn chmtime<'a>(
        &'a self,
        path: &'a str,
        t: DateTime<Utc>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let id = inner.resolve(path)?;
            inner.files.get_mut(&id).expect("resolve returns a live id").mtime = t;
            Ok(())
        })
    }

    fn create<'a>(
        &'a self,
        name: &'a str,
        parent_id: FileId,
        is_dir: bool,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<File>> + Send + 'a>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            inner.create(name.to_string(), parent_id, is_dir)
        })
    }

    fn update<'a>(
        &'a self,
        id: FileId,
        parent_hint: Option<FileId>,
        patch: UpdatePatch,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<File>> + Send + 'a>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            inner.require_not_root(id)?;
            {
                let file = inner.files.get(&id).ok_or_else(|| Error::NotExist {
                    path: id.to_string(),
                })?;
                inner.check_parent_hint(file, parent_hint)?;
            }
            let target_parent = patch
                .parent_id
                .unwrap_or_else(|| inner.files[&id].parent_id.expect("non-root has a parent"));
            let target_name = patch
                .name
                .clone()
                .unwrap_or_else(|| inner.files[&id].name.clone());
            if let Some(name) = &patch.name {
                validate_name(name)?;
            }
            if let Some(existing) = inner.child(target_parent, &target_name) {
                if existing.id != id {
                    return Err(Error::Exist { name: target_name });
                }
            }
            let file = inner.files.get_mut(&id).expect("checked above");
            file.parent_id = Some(target_parent);
            file.name = target_name;
            file.mtime = Utc::now();
            Ok(file.clone())
        })
    }

    fn delete<'a>(
        &'a self,
        id: FileId,
        parent_hint: Option<FileId>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            inner.require_not_root(id)?;
            {
                let file = inner.files.get(&id).ok_or_else(|| Error::NotExist {
                    path: id.to_string(),
                })?;
                inner.check_parent_hint(file, parent_hint)?;
            }
            inner.files.remove(&id);
            inner.nodes.remove(&id);
            Ok(())
        })
    }

    fn get_nodes<'a>(
        &'a self,
        file_id: FileId,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<Node>>> + Send + 'a>> {
        Box::pin(async move {
            let inner = self.inner.lock().await;
            Ok(inner.nodes.get(&file_id).cloned().unwrap_or_default())
        })
    }

    fn add_nodes<'a>(
        &'a self,
        file_id: FileId,
        nodes: Vec<Node>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let added_size: u64 = nodes.iter().map(|n| n.size).sum();
            inner.nodes.entry(file_id).or_default().extend(nodes);
            if let Some(file) = inner.files.get_mut(&file_id) {
                file.size += added_size;
                file.mtime = Utc::now();
            }
            Ok(())
        })
    }

    fn delete_nodes<'a>(
        &'a self,
        file_id: FileId,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            inner.nodes.remove(&file_id);
            if let Some(file) = inner.files.get_mut(&file_id) {
                file.size = 0;
            }
            Ok(())
        })
    }
}
