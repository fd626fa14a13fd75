//! `DatabaseOperation`: a set of enumerated queries over the synced-state
//! database, backed by `rusqlite`. Schema/ORM details stay intentionally
//! minimal.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Error;
use crate::model::{File, Node};
use crate::types::{FileId, NodeId, RelativeFilePath};

pub fn open(path: &Path) -> Result<Connection, Error> {
    let conn = Connection::open(path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection, Error> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS nodes (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            parent_id TEXT,
            sync INTEGER NOT NULL DEFAULT 0,
            rel_path TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS files (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            is_folder INTEGER NOT NULL,
            provider TEXT NOT NULL,
            parent TEXT,
            sha256 TEXT,
            node_id TEXT NOT NULL,
            alias TEXT,
            parent_rel_path TEXT NOT NULL,
            last_modified_timestamp INTEGER NOT NULL DEFAULT 0,
            revision_id TEXT NOT NULL DEFAULT ''
        );
        CREATE INDEX IF NOT EXISTS idx_files_node ON files(node_id);
        ",
    )?;
    Ok(())
}

/// Every access is wrapped in a single connection-scoped transaction so a
/// failed write rolls back cleanly.
pub struct DatabaseOperation<'c> {
    conn: &'c Connection,
}

impl<'c> DatabaseOperation<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    // --- Nodes -----------------------------------------------------

    /// Nodes where `sync = true`.
    pub fn synced_nodes(&self) -> Result<Vec<Node>, Error> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, title, parent_id, sync, rel_path FROM nodes WHERE sync = 1")?;
        let rows = stmt.query_map([], Self::row_to_node)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row?);
        }
        Ok(nodes)
    }

    /// Node by `id`.
    pub fn node_by_id(&self, id: &NodeId) -> Result<Option<Node>, Error> {
        self.conn
            .query_row(
                "SELECT id, title, parent_id, sync, rel_path FROM nodes WHERE id = ?1",
                params![id.0],
                Self::row_to_node,
            )
            .optional()
            .map_err(Error::from)
    }

    pub fn upsert_node(&self, node: &Node) -> Result<(), Error> {
        self.conn.execute(
            "INSERT INTO nodes (id, title, parent_id, sync, rel_path) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET title = ?2, parent_id = ?3, sync = ?4, rel_path = ?5",
            params![
                node.id.0,
                node.title,
                node.parent_id.as_ref().map(|n| n.0.clone()),
                node.sync as i64,
                node.rel_path,
            ],
        )?;
        Ok(())
    }

    fn row_to_node(row: &rusqlite::Row) -> rusqlite::Result<Node> {
        Ok(Node {
            id: NodeId(row.get(0)?),
            title: row.get(1)?,
            parent_id: row.get::<_, Option<String>>(2)?.map(NodeId),
            sync: row.get::<_, i64>(3)? != 0,
            rel_path: row.get(4)?,
        })
    }

    // --- Files -------------------------------------------------------

    /// All File rows.
    pub fn all_files(&self) -> Result<Vec<File>, Error> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, is_folder, provider, parent, sha256, node_id, alias, parent_rel_path FROM files",
        )?;
        let rows = stmt.query_map([], Self::row_to_file)?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    fn row_to_file(row: &rusqlite::Row) -> rusqlite::Result<File> {
        Ok(File {
            id: FileId(row.get(0)?),
            name: row.get(1)?,
            is_folder: row.get::<_, i64>(2)? != 0,
            provider: row.get(3)?,
            parent: row.get::<_, Option<String>>(4)?.map(FileId),
            sha256: row.get(5)?,
            node_id: NodeId(row.get(6)?),
            alias: row.get(7)?,
            parent_rel_path: row.get(8)?,
        })
    }

    fn find_by_rel_path(&self, relative_path: &str) -> Result<Option<File>, Error> {
        for file in self.all_files()? {
            if file.rel_path() == relative_path || file.rel_path_unaliased() == relative_path {
                return Ok(Some(file));
            }
        }
        Ok(None)
    }

    pub fn relative_path_is_known(&self, relative_path: &str) -> Result<bool, Error> {
        Ok(self.find_by_rel_path(relative_path)?.is_some())
    }

    /// All known relative paths, used by `LocalSync::sync_from_db` to spot
    /// rows whose file vanished from disk between runs.
    pub fn get_relative_paths(&self) -> Result<Vec<RelativeFilePath>, Error> {
        Ok(self.all_files()?.iter().map(|f| f.rel_path()).collect())
    }

    pub fn get_last_modified_timestamp(&self, relative_path: &str) -> Result<u64, Error> {
        match self.find_by_rel_path(relative_path)? {
            Some(_) => self
                .conn
                .query_row(
                    "SELECT last_modified_timestamp FROM files WHERE parent_rel_path || name = ?1 OR parent_rel_path || alias = ?1",
                    params![relative_path],
                    |row| row.get::<_, i64>(0),
                )
                .map(|v| v as u64)
                .map_err(Error::from),
            None => Err(Error::UnexpectedError(format!(
                "No known file at {:?}",
                relative_path
            ))),
        }
    }

    /// Resolves a relative path to a `FileId`, returning
    /// `Error::UnIndexedRelativePath(parent)` when the parent folder isn't
    /// indexed yet.
    pub fn get_file_id_from_path(&self, relative_path: &str) -> Result<FileId, Error> {
        match self.find_by_rel_path(relative_path)? {
            Some(file) => Ok(file.id),
            None => {
                let parent = Path::new(relative_path)
                    .parent()
                    .and_then(|p| p.to_str())
                    .unwrap_or("")
                    .to_string();
                Err(Error::UnIndexedRelativePath(parent))
            }
        }
    }

    pub fn content_id_is_known(&self, file_id: &FileId) -> Result<bool, Error> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM files WHERE id = ?1",
            params![file_id.0],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_path_from_content_id(&self, file_id: &FileId) -> Result<RelativeFilePath, Error> {
        let file = self.get_file(file_id)?;
        Ok(file.rel_path())
    }

    pub fn get_file(&self, file_id: &FileId) -> Result<File, Error> {
        self.conn
            .query_row(
                "SELECT id, name, is_folder, provider, parent, sha256, node_id, alias, parent_rel_path FROM files WHERE id = ?1",
                params![file_id.0],
                Self::row_to_file,
            )
            .map_err(Error::from)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_new_file(
        &self,
        relative_path: RelativeFilePath,
        is_folder: bool,
        node_id: NodeId,
        file_id: FileId,
        last_modified_timestamp: u64,
        revision_id: String,
    ) -> Result<(), Error> {
        let path = Path::new(&relative_path);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let parent_rel_path = path
            .parent()
            .map(|p| {
                let mut s = p.to_string_lossy().into_owned();
                if !s.is_empty() && !s.ends_with(std::path::MAIN_SEPARATOR) {
                    s.push(std::path::MAIN_SEPARATOR);
                }
                s
            })
            .unwrap_or_default();

        self.conn.execute(
            "INSERT INTO files (id, name, is_folder, provider, parent, sha256, node_id, alias, parent_rel_path, last_modified_timestamp, revision_id)
             VALUES (?1, ?2, ?3, 'osfstorage', NULL, NULL, ?4, NULL, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET name = ?2, is_folder = ?3, parent_rel_path = ?5, last_modified_timestamp = ?6, revision_id = ?7",
            params![file_id.0, name, is_folder as i64, node_id.0, parent_rel_path, last_modified_timestamp as i64, revision_id],
        )?;
        Ok(())
    }

    pub fn update_last_modified_timestamp(
        &self,
        relative_path: RelativeFilePath,
        timestamp: u64,
    ) -> Result<(), Error> {
        let file = self
            .find_by_rel_path(&relative_path)?
            .ok_or_else(|| Error::UnIndexedRelativePath(relative_path.clone()))?;
        self.conn.execute(
            "UPDATE files SET last_modified_timestamp = ?1 WHERE id = ?2",
            params![timestamp as i64, file.id.0],
        )?;
        Ok(())
    }

    pub fn update_revision_id(
        &self,
        relative_path: RelativeFilePath,
        revision_id: String,
    ) -> Result<(), Error> {
        let file = self
            .find_by_rel_path(&relative_path)?
            .ok_or_else(|| Error::UnIndexedRelativePath(relative_path.clone()))?;
        self.conn.execute(
            "UPDATE files SET revision_id = ?1 WHERE id = ?2",
            params![revision_id, file.id.0],
        )?;
        Ok(())
    }

    pub fn update_relative_path(
        &self,
        file_id: FileId,
        new_relative_path: RelativeFilePath,
    ) -> Result<(), Error> {
        let path = Path::new(&new_relative_path);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let parent_rel_path = path
            .parent()
            .map(|p| {
                let mut s = p.to_string_lossy().into_owned();
                if !s.is_empty() && !s.ends_with(std::path::MAIN_SEPARATOR) {
                    s.push(std::path::MAIN_SEPARATOR);
                }
                s
            })
            .unwrap_or_default();
        self.conn.execute(
            "UPDATE files SET name = ?1, parent_rel_path = ?2, alias = NULL WHERE id = ?3",
            params![name, parent_rel_path, file_id.0],
        )?;
        Ok(())
    }

    pub fn set_alias(&self, file_id: &FileId, alias: Option<String>) -> Result<(), Error> {
        self.conn.execute(
            "UPDATE files SET alias = ?1 WHERE id = ?2",
            params![alias, file_id.0],
        )?;
        Ok(())
    }

    pub fn delete_file(&self, file_id: FileId) -> Result<(), Error> {
        self.conn
            .execute("DELETE FROM files WHERE id = ?1", params![file_id.0])?;
        Ok(())
    }

    /// Deletes a folder row and every descendant row beneath it.
    pub fn delete_folder(&self, file_id: FileId) -> Result<(), Error> {
        let folder_path = self.get_path_from_content_id(&file_id)?;
        self.conn
            .execute("DELETE FROM files WHERE id = ?1", params![file_id.0])?;
        self.conn.execute(
            "DELETE FROM files WHERE parent_rel_path LIKE ?1",
            params![format!("{}%", folder_path)],
        )?;
        Ok(())
    }
}
