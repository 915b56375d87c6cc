use sled::{Db, Tree};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    DbError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// 简单的键值数据库
#[derive(Clone)]
pub struct Database {
    /// sled数据库实例
    db: Db,
}

impl Database {
    /// 打开或创建数据库
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// 临时数据库，关闭后删除
    pub fn temporary() -> Result<Self, DatabaseError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// 获取树
    pub fn tree(&self, name: &str) -> Result<Tree, DatabaseError> {
        Ok(self.db.open_tree(name)?)
    }

    /// 获取序列化的值
    pub fn get_serialized<T: serde::de::DeserializeOwned>(
        &self,
        tree: &str,
        key: &[u8],
    ) -> Result<Option<T>, DatabaseError> {
        match self.tree(tree)?.get(key)? {
            Some(value) => bincode::deserialize(&value)
                .map_err(|e| DatabaseError::DeserializationError(e.to_string()))
                .map(Some),
            None => Ok(None),
        }
    }

    /// 设置序列化的值
    pub fn put_serialized<T: serde::Serialize>(
        &self,
        tree: &str,
        key: &[u8],
        value: &T,
    ) -> Result<(), DatabaseError> {
        let data = bincode::serialize(value).map_err(|e| DatabaseError::SerializationError(e.to_string()))?;

        self.tree(tree)?.insert(key, data)?;
        Ok(())
    }

    /// 树中的条目数
    pub fn count(&self, tree: &str) -> Result<usize, DatabaseError> {
        Ok(self.tree(tree)?.len())
    }

    /// 刷新到磁盘
    pub fn flush(&self) -> Result<(), DatabaseError> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}
