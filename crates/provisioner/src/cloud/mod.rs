/// 云厂商抽象
///
/// 具体的 HTTP 客户端由调用方通过工厂注入

use async_trait::async_trait;
use common::models::{CloudInstance, KeyPair};
use common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

/// 云厂商 API
#[async_trait]
pub trait CloudProvider: Send + Sync + 'static {
    /// 使用构造时的凭据认证
    async fn authenticate(&self) -> Result<()>;

    /// 可用区域，顺序由云厂商决定
    async fn list_regions(&self) -> Result<Vec<String>>;

    async fn set_region(&self, region: &str) -> Result<()>;

    async fn list_instances(&self) -> Result<Vec<CloudInstance>>;

    async fn create_key_pair(&self, name: &str) -> Result<KeyPair>;

    async fn create_instance(
        &self,
        name: &str,
        flavor_id: &str,
        image_id: &str,
        key_pair: &KeyPair,
    ) -> Result<CloudInstance>;

    /// 删除实例，返回云厂商是否确认
    async fn delete_instance(&self, instance: &CloudInstance) -> Result<bool>;
}

/// 云凭据设置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudSettings {
    pub user_name: String,
    pub api_key: String,
    /// 为空时使用云厂商列出的第一个区域
    pub region: String,
    pub ias_url: String,
}

impl CloudSettings {
    pub const USER_NAME: &'static str = "cloud_user_name";
    pub const API_KEY: &'static str = "cloud_api_key";
    pub const REGION: &'static str = "cloud_region";
    pub const IAS_URL: &'static str = "gns3_ias_url";

    /// 从设置映射读取，缺少任一键都是配置错误
    pub fn from_map(settings: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            settings
                .get(key)
                .cloned()
                .ok_or_else(|| Error::Configuration(format!("缺少云设置: {}", key)))
        };

        Ok(Self {
            user_name: get(Self::USER_NAME)?,
            api_key: get(Self::API_KEY)?,
            region: get(Self::REGION)?,
            ias_url: get(Self::IAS_URL)?,
        })
    }
}

/// 构造并认证云厂商，设置区域
pub async fn try_get_provider<F>(
    settings: &HashMap<String, String>,
    factory: F,
) -> Result<Arc<dyn CloudProvider>>
where
    F: FnOnce(&CloudSettings) -> Arc<dyn CloudProvider>,
{
    let settings = CloudSettings::from_map(settings)?;
    let provider = factory(&settings);

    provider
        .authenticate()
        .await
        .map_err(|e| Error::Configuration(format!("云厂商认证失败: {}", e)))?;

    let region = if settings.region.is_empty() {
        provider
            .list_regions()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Configuration("云厂商没有可用区域".to_string()))?
    } else {
        settings.region.clone()
    };

    provider
        .set_region(&region)
        .await
        .map_err(|e| Error::Configuration(format!("无法设置区域 {}: {}", region, e)))?;

    info!("云厂商已就绪: user={}, region={}", settings.user_name, region);
    Ok(provider)
}

/// 同 [`try_get_provider`]，失败时记录日志并返回 None
pub async fn get_provider<F>(
    settings: &HashMap<String, String>,
    factory: F,
) -> Option<Arc<dyn CloudProvider>>
where
    F: FnOnce(&CloudSettings) -> Arc<dyn CloudProvider>,
{
    match try_get_provider(settings, factory).await {
        Ok(provider) => Some(provider),
        Err(e) => {
            error!("无法创建云厂商: {}", e);
            None
        }
    }
}
