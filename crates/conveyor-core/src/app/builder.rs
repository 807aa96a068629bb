//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）

use std::sync::Arc;

use crate::app::engine::TaskEngine;
use crate::app::registry::{RegistryError, ResourceRegistry};
use crate::config::EngineConfig;
use crate::impls::InMemoryTaskStore;
use crate::ports::{Clock, RandomTokenGenerator, ResourceProvider, SystemClock, TaskStore, TokenGenerator};

/// EngineBuilder は TaskEngine を構築
///
/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new()
///     .config(cfg.engine.clone())
///     .register(ImportProvider::new())?
///     .expect_models(&["sale.import"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_models() で期待される model 名を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - store / clock / token generator は未指定ならデフォルト（in-memory / system / random）
pub struct EngineBuilder {
    registry: ResourceRegistry,
    expected_models: Option<Vec<String>>,
    store: Option<Arc<dyn TaskStore>>,
    clock: Option<Arc<dyn Clock>>,
    tokens: Option<Arc<dyn TokenGenerator>>,
    config: EngineConfig,
}

/// BuildError はエンジン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing resource models: {0:?}. These models were expected but not registered.")]
    MissingModels(Vec<String>),
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            registry: ResourceRegistry::new(),
            expected_models: None,
            store: None,
            clock: None,
            tokens: None,
            config: EngineConfig::default(),
        }
    }

    /// Provider を登録
    pub fn register<P: ResourceProvider + 'static>(
        mut self,
        provider: P,
    ) -> Result<Self, RegistryError> {
        self.registry.register(provider)?;
        Ok(self)
    }

    pub fn register_arc(mut self, provider: Arc<dyn ResourceProvider>) -> Result<Self, RegistryError> {
        self.registry.register_arc(provider)?;
        Ok(self)
    }

    /// 期待される model 名のリストを設定
    pub fn expect_models(mut self, models: &[&str]) -> Self {
        self.expected_models = Some(models.iter().map(|m| m.to_string()).collect());
        self
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn tokens(mut self, tokens: Arc<dyn TokenGenerator>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// # 検証
    /// - expect_models() で設定された model が全て登録されているかチェック
    pub fn build(self) -> Result<TaskEngine, BuildError> {
        if let Some(expected) = &self.expected_models {
            let registered = self.registry.registered_models();
            let missing: Vec<String> = expected
                .iter()
                .filter(|m| !registered.contains(m))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingModels(missing));
            }
        }

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let tokens: Arc<dyn TokenGenerator> = self
            .tokens
            .unwrap_or_else(|| Arc::new(RandomTokenGenerator::new(Arc::clone(&clock))));
        let store: Arc<dyn TaskStore> = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()));

        Ok(TaskEngine::new(
            store,
            Arc::new(self.registry),
            clock,
            tokens,
            self.config,
        ))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
