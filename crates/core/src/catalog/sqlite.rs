use std::path::Path;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{FromRow, Row, SqlitePool};

use super::{split_path, validate_name, Catalog, File, FileId, Node, UpdatePatch, ROOT_ID};
use crate::{Error, Result};

#[derive(FromRow)]
struct FileRow {
    id: String,
    name: String,
    parent_id: Option<String>,
    is_directory: i64,
    size: i64,
    mtime: DateTime<Utc>,
}

impl FileRow {
    fn into_file(self) -> Result<File> {
        Ok(File {
            id: parse_id(&self.id)?,
            name: self.name,
            parent_id: self.parent_id.as_deref().map(parse_id).transpose()?,
            is_directory: self.is_directory != 0,
            size: self.size as u64,
            mtime: self.mtime,
        })
    }
}

fn parse_id(s: &str) -> Result<FileId> {
    FileId::parse_str(s).map_err(|e| Error::Malformed {
        message: format!("invalid catalog row id {s}: {e}"),
    })
}

/// A SQLite-backed catalog: a single-writer connection pool with foreign
/// keys enforced, storing the directory tree and each file's ordered node
/// list across restarts.
pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    pub async fn connect(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    async fn get_file_row(&self, id: FileId) -> Result<Option<File>> {
        let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(FileRow::into_file).transpose()
    }

    async fn find_child(&self, parent_id: FileId, name: &str) -> Result<Option<File>> {
        let row = sqlx::query_as::<_, FileRow>(
            "SELECT * FROM files WHERE parent_id = ? AND name = ?",
        )
        .bind(parent_id.to_string())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(FileRow::into_file).transpose()
    }

    async fn resolve(&self, path: &str) -> Result<FileId> {
        let mut current = ROOT_ID;
        for segment in split_path(path) {
            let parent = self
                .get_file_row(current)
                .await?
                .expect("current is always a previously-resolved live id");
            if !parent.is_directory {
                return Err(Error::InvalidParent {
                    message: format!("{} is not a directory", parent.name),
                });
            }
            current = self
                .find_child(current, segment)
                .await?
                .ok_or_else(|| Error::NotExist {
                    path: path.to_string(),
                })?
                .id;
        }
        Ok(current)
    }

    async fn parent_of(&self, path: &str) -> Result<(FileId, String)> {
        let segments = split_path(path);
        let Some((name, parent_segments)) = segments.split_last() else {
            return Err(Error::InvalidParent {
                message: "path has no parent".to_string(),
            });
        };
        validate_name(name)?;
        let parent_path = parent_segments.join("/");
        let parent_id = self.resolve(&parent_path).await?;
        Ok((parent_id, (*name).to_string()))
    }

    async fn insert(&self, name: String, parent_id: FileId, is_dir: bool) -> Result<File> {
        validate_name(&name)?;
        let parent = self
            .get_file_row(parent_id)
            .await?
            .ok_or_else(|| Error::InvalidParent {
                message: format!("parent {parent_id} does not exist"),
            })?;
        if !parent.is_directory {
            return Err(Error::InvalidParent {
                message: format!("{} is not a directory", parent.name),
            });
        }
        if self.find_child(parent_id, &name).await?.is_some() {
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
        sqlx::query(
            "INSERT INTO files (id, name, parent_id, is_directory, size, mtime) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(file.id.to_string())
        .bind(&file.name)
        .bind(file.parent_id.map(|p| p.to_string()))
        .bind(file.is_directory as i64)
        .bind(file.size as i64)
        .bind(file.mtime)
        .execute(&self.pool)
        .await?;
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

impl Catalog for SqliteCatalog {
    fn stat<'a>(&'a self, path: &'a str) -> Pin<Box<dyn std::future::Future<Output = Result<File>> + Send + 'a>> {
        Box::pin(async move {
            let id = self.resolve(path).await?;
            self.get_file_row(id)
                .await?
                .ok_or_else(|| Error::NotExist { path: path.to_string() })
        })
    }

    fn get<'a>(
        &'a self,
        id: FileId,
        parent_hint: Option<FileId>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<File>> + Send + 'a>> {
        Box::pin(async move {
            let file = self
                .get_file_row(id)
                .await?
                .ok_or_else(|| Error::NotExist { path: id.to_string() })?;
            self.check_parent_hint(&file, parent_hint)?;
            Ok(file)
        })
    }

    fn ls<'a>(
        &'a self,
        path: &'a str,
        limit: usize,
        offset: usize,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<File>>> + Send + 'a>> {
        Box::pin(async move {
            let id = self.resolve(path).await?;
            let rows = sqlx::query_as::<_, FileRow>(
                "SELECT * FROM files WHERE parent_id = ? ORDER BY name LIMIT ? OFFSET ?",
            )
            .bind(id.to_string())
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(FileRow::into_file).collect()
        })
    }

    fn get_children<'a>(
        &'a self,
        parent_id: FileId,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<File>>> + Send + 'a>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, FileRow>(
                "SELECT * FROM files WHERE parent_id = ? ORDER BY name",
            )
            .bind(parent_id.to_string())
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(FileRow::into_file).collect()
        })
    }

    fn touch<'a>(&'a self, path: &'a str) -> Pin<Box<dyn std::future::Future<Output = Result<File>> + Send + 'a>> {
        Box::pin(async move {
            if let Ok(id) = self.resolve(path).await {
                let now = Utc::now();
                sqlx::query("UPDATE files SET mtime = ? WHERE id = ?")
                    .bind(now)
                    .bind(id.to_string())
                    .execute(&self.pool)
                    .await?;
                return self
                    .get_file_row(id)
                    .await?
                    .ok_or_else(|| Error::NotExist { path: path.to_string() });
            }
            let (parent_id, name) = self.parent_of(path).await?;
            self.insert(name, parent_id, false).await
        })
    }

    fn mkdir<'a>(&'a self, path: &'a str) -> Pin<Box<dyn std::future::Future<Output = Result<File>> + Send + 'a>> {
        Box::pin(async move {
            let (parent_id, name) = self.parent_of(path).await?;
            self.insert(name, parent_id, true).await
        })
    }

    fn rm<'a>(&'a self, path: &'a str) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let id = self.resolve(path).await?;
            self.require_not_root(id)?;

            let mut stack = vec![id];
            let mut doomed = Vec::new();
            while let Some(current) = stack.pop() {
                doomed.push(current);
                let children = sqlx::query("SELECT id FROM files WHERE parent_id = ?")
                    .bind(current.to_string())
                    .fetch_all(&self.pool)
                    .await?;
                for row in children {
                    let child_id: String = row.try_get("id")?;
                    stack.push(parse_id(&child_id)?);
                }
            }
            let mut tx = self.pool.begin().await?;
            for doomed_id in doomed {
                sqlx::query("DELETE FROM nodes WHERE file_id = ?")
                    .bind(doomed_id.to_string())
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM files WHERE id = ?")
                    .bind(doomed_id.to_string())
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok(())
        })
    }

    fn mv<'a>(&'a self, src: &'a str, dst: &'a str) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let id = self.resolve(src).await?;
            self.require_not_root(id)?;
            let (new_parent, new_name) = self.parent_of(dst).await?;
            if self.find_child(new_parent, &new_name).await?.is_some() {
                return Err(Error::Exist { name: new_name });
            }
            sqlx::query("UPDATE files SET parent_id = ?, name = ?, mtime = ? WHERE id = ?")
                .bind(new_parent.to_string())
                .bind(&new_name)
                .bind(Utc::now())
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    fn chmtime<'a>(
        &'a self,
        path: &'a str,
        t: DateTime<Utc>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let id = self.resolve(path).await?;
            sqlx::query("UPDATE files SET mtime = ? WHERE id = ?")
                .bind(t)
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    fn create<'a>(
        &'a self,
        name: &'a str,
        parent_id: FileId,
        is_dir: bool,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<File>> + Send + 'a>> {
        Box::pin(async move { self.insert(name.to_string(), parent_id, is_dir).await })
    }

    fn update<'a>(
        &'a self,
        id: FileId,
        parent_hint: Option<FileId>,
        patch: UpdatePatch,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<File>> + Send + 'a>> {
        Box::pin(async move {
            self.require_not_root(id)?;
            let file = self
                .get_file_row(id)
                .await?
                .ok_or_else(|| Error::NotExist { path: id.to_string() })?;
            self.check_parent_hint(&file, parent_hint)?;

            let target_parent = patch.parent_id.unwrap_or(file.parent_id.expect("non-root has a parent"));
            let target_name = patch.name.clone().unwrap_or_else(|| file.name.clone());
            if let Some(name) = &patch.name {
                validate_name(name)?;
            }
            if let Some(existing) = self.find_child(target_parent, &target_name).await? {
                if existing.id != id {
                    return Err(Error::Exist { name: target_name });
                }
            }
            sqlx::query("UPDATE files SET parent_id = ?, name = ?, mtime = ? WHERE id = ?")
                .bind(target_parent.to_string())
                .bind(&target_name)
                .bind(Utc::now())
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
            self.get_file_row(id)
                .await?
                .ok_or_else(|| Error::NotExist { path: id.to_string() })
        })
    }

    fn delete<'a>(
        &'a self,
        id: FileId,
        parent_hint: Option<FileId>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.require_not_root(id)?;
            let file = self
                .get_file_row(id)
                .await?
                .ok_or_else(|| Error::NotExist { path: id.to_string() })?;
            self.check_parent_hint(&file, parent_hint)?;
            sqlx::query("DELETE FROM nodes WHERE file_id = ?")
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
            sqlx::query("DELETE FROM files WHERE id = ?")
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
            Ok(())
        })
    }

    fn get_nodes<'a>(
        &'a self,
        file_id: FileId,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Vec<Node>>> + Send + 'a>> {
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT url, size, chunk_index, iv FROM nodes WHERE file_id = ? ORDER BY seq",
            )
            .bind(file_id.to_string())
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter()
                .map(|row| {
                    Ok(Node {
                        file_id,
                        url: row.try_get("url")?,
                        size: row.try_get::<i64, _>("size")? as u64,
                        index: row.try_get::<i64, _>("chunk_index")? as u32,
                        iv: row.try_get("iv")?,
                    })
                })
                .collect()
        })
    }

    fn add_nodes<'a>(
        &'a self,
        file_id: FileId,
        nodes: Vec<Node>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let added_size: i64 = nodes.iter().map(|n| n.size as i64).sum();
            let mut tx = self.pool.begin().await?;
            let next_seq: i64 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(seq), -1) + 1 FROM nodes WHERE file_id = ?",
            )
            .bind(file_id.to_string())
            .fetch_one(&mut *tx)
            .await?;
            for (offset, node) in nodes.into_iter().enumerate() {
                sqlx::query(
                    "INSERT INTO nodes (file_id, seq, url, size, chunk_index, iv) VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(file_id.to_string())
                .bind(next_seq + offset as i64)
                .bind(&node.url)
                .bind(node.size as i64)
                .bind(node.index as i64)
                .bind(node.iv)
                .execute(&mut *tx)
                .await?;
            }
            sqlx::query("UPDATE files SET size = size + ?, mtime = ? WHERE id = ?")
                .bind(added_size)
                .bind(Utc::now())
                .bind(file_id.to_string())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        })
    }

    fn delete_nodes<'a>(
        &'a self,
        file_id: FileId,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM nodes WHERE file_id = ?")
                .bind(file_id.to_string())
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE files SET size = 0 WHERE id = ?")
                .bind(file_id.to_string())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        })
    }
}
