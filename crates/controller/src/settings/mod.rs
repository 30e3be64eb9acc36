/// 持久化设置存储
///
/// 所有分组保存在同一个 JSON 文件中：
/// - 普通分组是扁平的键值对
/// - 集合分组包含一个记录数组，加载时按组合键建立索引

pub mod schema;

use common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub use schema::{SettingKind, SettingsSchema};

/// 一个分组的设置
pub type Settings = Map<String, Value>;

/// 设置存储
pub struct SettingsStore {
    /// 设置文件路径，None 表示只保存在内存中
    path: Option<PathBuf>,

    /// 整个设置文档
    document: RwLock<Map<String, Value>>,
}

impl SettingsStore {
    /// 打开设置文件
    ///
    /// 文件不存在时视为空；文件损坏时记录警告并视为空
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let document = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<Value>(&content) {
                Ok(Value::Object(map)) => map,
                Ok(_) | Err(_) => {
                    warn!("设置文件 {:?} 格式错误，使用空设置", path);
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("设置文件 {:?} 不存在，使用默认设置", path);
                Map::new()
            }
            Err(e) => {
                return Err(Error::Storage(format!("无法读取设置文件 {:?}: {}", path, e)));
            }
        };

        Ok(Self {
            path: Some(path),
            document: RwLock::new(document),
        })
    }

    /// 创建仅在内存中的存储
    pub fn in_memory() -> Self {
        Self {
            path: None,
            document: RwLock::new(Map::new()),
        }
    }

    /// 设置文件路径
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// 按 schema 加载一个分组，缺失或类型不符的键使用默认值
    pub async fn load(&self, group: &str, schema: &SettingsSchema) -> Settings {
        let document = self.document.read().await;
        let stored = document.get(group).and_then(Value::as_object);
        schema.apply(stored)
    }

    /// 保存一个分组（逐键覆盖）
    pub async fn save(&self, group: &str, settings: &Settings) -> Result<()> {
        {
            let mut document = self.document.write().await;
            let entry = document
                .entry(group.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(map) = entry {
                for (name, value) in settings {
                    map.insert(name.clone(), value.clone());
                }
            }
        }
        debug!("保存设置分组: {}", group);
        self.flush().await
    }

    /// 加载集合分组，返回按组合键索引的记录
    ///
    /// 无法解析的记录会被跳过
    pub async fn load_keyed_collection<T, F>(
        &self,
        group: &str,
        array: &str,
        item_schema: &SettingsSchema,
        key: F,
    ) -> BTreeMap<String, T>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> String,
    {
        let document = self.document.read().await;
        let records = document
            .get(group)
            .and_then(|g| g.get(array))
            .and_then(Value::as_array);

        let mut collection = BTreeMap::new();
        for (index, record) in records.into_iter().flatten().enumerate() {
            let coerced = item_schema.apply(record.as_object());
            match serde_json::from_value::<T>(Value::Object(coerced)) {
                Ok(item) => {
                    collection.insert(key(&item), item);
                }
                Err(e) => {
                    warn!("跳过 {}/{} 第 {} 条记录: {}", group, array, index, e);
                }
            }
        }
        collection
    }

    /// 保存集合分组，完全覆盖原有内容
    pub async fn save_keyed_collection<'a, T, I>(
        &self,
        group: &str,
        array: &str,
        items: I,
    ) -> Result<()>
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = &'a T>,
    {
        let records = items
            .into_iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let count = records.len();

        {
            let mut document = self.document.write().await;
            let mut group_map = Map::new();
            group_map.insert(array.to_string(), Value::Array(records));
            document.insert(group.to_string(), Value::Object(group_map));
        }
        debug!("保存集合分组: {} ({} 条记录)", group, count);
        self.flush().await
    }

    /// 把整个文档写回磁盘（先写临时文件再改名）
    async fn flush(&self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let content = {
            let document = self.document.read().await;
            serde_json::to_string_pretty(&*document)?
        };

        tokio::task::spawn_blocking(move || write_atomically(&path, content.as_bytes()))
            .await
            .map_err(|e| Error::Internal(format!("写设置任务失败: {}", e)))?
    }
}

fn write_atomically(path: &Path, content: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)
        .map_err(|e| Error::Storage(format!("无法创建目录 {:?}: {}", dir, e)))?;

    let mut file = tempfile::NamedTempFile::new_in(&dir)
        .map_err(|e| Error::Storage(format!("无法创建临时文件: {}", e)))?;
    file.write_all(content)
        .map_err(|e| Error::Storage(format!("写设置文件失败: {}", e)))?;
    file.persist(path)
        .map_err(|e| Error::Storage(format!("无法替换设置文件 {:?}: {}", path, e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        count: i64,
        enabled: bool,
        owner: String,
    }

    fn record_schema() -> SettingsSchema {
        SettingsSchema::new()
            .string("name", "")
            .int("count", 1)
            .bool("enabled", true)
            .string("owner", "local")
    }

    fn general_schema() -> SettingsSchema {
        SettingsSchema::new()
            .bool("use_local_server", true)
            .int("console_start_port_range", 3501)
    }

    #[tokio::test]
    async fn test_missing_group_yields_defaults() {
        let store = SettingsStore::in_memory();
        let settings = store.load("Nothing", &general_schema()).await;
        assert_eq!(settings["use_local_server"], json!(true));
        assert_eq!(settings["console_start_port_range"], json!(3501));

        let collection: BTreeMap<String, Record> = store
            .load_keyed_collection("Nothing", "VM", &record_schema(), |r: &Record| r.name.clone())
            .await;
        assert!(collection.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let store = SettingsStore::open(&path).await.unwrap();
        let mut settings = store.load("General", &general_schema()).await;
        settings.insert("use_local_server".into(), json!(false));
        store.save("General", &settings).await.unwrap();

        let reopened = SettingsStore::open(&path).await.unwrap();
        let loaded = reopened.load("General", &general_schema()).await;
        assert_eq!(loaded["use_local_server"], json!(false));
        assert_eq!(loaded["console_start_port_range"], json!(3501));
    }

    #[tokio::test]
    async fn test_keyed_collection_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::open(&path).await.unwrap();

        let records = vec![
            Record { name: "win7".into(), count: 4, enabled: false, owner: "local".into() },
            Record { name: "ubuntu".into(), count: 2, enabled: true, owner: "10.0.0.2".into() },
        ];
        store.save_keyed_collection("Vms", "VM", &records).await.unwrap();

        let reopened = SettingsStore::open(&path).await.unwrap();
        let loaded: BTreeMap<String, Record> = reopened
            .load_keyed_collection("Vms", "VM", &record_schema(), |r: &Record| {
                format!("{}:{}", r.owner, r.name)
            })
            .await;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["local:win7"], records[0]);
        assert_eq!(loaded["10.0.0.2:ubuntu"], records[1]);
    }

    #[tokio::test]
    async fn test_collection_save_overwrites() {
        let store = SettingsStore::in_memory();
        let first = vec![
            Record { name: "a".into(), count: 1, enabled: true, owner: "local".into() },
            Record { name: "b".into(), count: 1, enabled: true, owner: "local".into() },
        ];
        store.save_keyed_collection("Vms", "VM", &first).await.unwrap();

        let second = vec![Record { name: "c".into(), count: 1, enabled: true, owner: "local".into() }];
        store.save_keyed_collection("Vms", "VM", &second).await.unwrap();

        let loaded: BTreeMap<String, Record> = store
            .load_keyed_collection("Vms", "VM", &record_schema(), |r: &Record| r.name.clone())
            .await;
        assert_eq!(loaded.keys().cloned().collect::<Vec<_>>(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_coercion_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"Vms": {"VM": [{"name": "xp", "count": "3", "enabled": "false"}]},
                "General": {"use_local_server": "true", "console_start_port_range": "oops"}}"#,
        )
        .unwrap();

        let store = SettingsStore::open(&path).await.unwrap();
        let general = store.load("General", &general_schema()).await;
        assert_eq!(general["use_local_server"], json!(true));
        assert_eq!(general["console_start_port_range"], json!(3501));

        let loaded: BTreeMap<String, Record> = store
            .load_keyed_collection("Vms", "VM", &record_schema(), |r: &Record| r.name.clone())
            .await;
        let xp = &loaded["xp"];
        assert_eq!(xp.count, 3);
        assert!(!xp.enabled);
        assert_eq!(xp.owner, "local");
    }

    #[tokio::test]
    async fn test_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = SettingsStore::open(&path).await.unwrap();
        let general = store.load("General", &general_schema()).await;
        assert_eq!(general["use_local_server"], json!(true));
    }
}
