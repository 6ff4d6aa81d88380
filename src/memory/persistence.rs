//! JSON 文件持久化
//!
//! 学习日志与后端注册表共用：整文件读写，写入时先写临时文件再原子 rename，避免崩溃留下半个文件。
//! 同一文件的写入（包括克隆出的句柄）经同一把锁串行，临时文件不会被并发写者抢走。

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::DaemonError;

/// 单文件 JSON 存储
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl JsonFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取文件；不存在时返回 None
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>, DaemonError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.path)?;
        let value = serde_json::from_str(&data)?;
        Ok(Some(value))
    }

    /// 写入文件；父目录不存在时自动创建
    pub fn save<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), DaemonError> {
        self.save_with(|| value)
    }

    /// 持有写锁后再取快照并写入：后完成的写入总是带着更新的数据
    pub fn save_with<T, F>(&self, snapshot: F) -> Result<(), DaemonError>
    where
        T: Serialize,
        F: FnOnce() -> T,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let data = serde_json::to_vec(&snapshot())?;
        let tmp = self.tmp_path();
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            DaemonError::Persistence(format!("rename {} failed: {}", tmp.display(), e))
        })
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonFile::new(dir.path().join("absent.json"));
        let loaded: Option<Vec<String>> = file.load().unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_save_creates_parent_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonFile::new(dir.path().join("nested/state.json"));
        file.save(&vec!["a".to_string()]).unwrap();
        file.save(&vec!["b".to_string(), "c".to_string()]).unwrap();

        let loaded: Vec<String> = file.load().unwrap().unwrap();
        assert_eq!(loaded, vec!["b", "c"]);
        assert!(!dir.path().join("nested/state.json.tmp").exists());
    }

    #[test]
    fn test_concurrent_saves_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonFile::new(dir.path().join("models.json"));
        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let file = file.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .filter(|i| file.save(&vec![worker, *i]).is_err())
                        .count()
                })
            })
            .collect();
        let failures: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
        assert_eq!(failures, 0);
        let last: Vec<i32> = file.load().unwrap().unwrap();
        assert_eq!(last.len(), 2);
    }

    #[test]
    fn test_invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let loaded: Result<Option<Vec<String>>, _> = JsonFile::new(&path).load();
        assert!(loaded.is_err());
    }
}
