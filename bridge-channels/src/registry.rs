use crate::traits::PlatformAdapter;
use crate::types::PlatformType;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Adapters keyed by platform; consulted for inbound dispatch and outbound replies.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Arc<RwLock<HashMap<PlatformType, Arc<dyn PlatformAdapter>>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, platform: PlatformType) -> Option<Arc<dyn PlatformAdapter>> {
        let guard = self
            .adapters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.get(&platform).cloned()
    }

    /// Registers the adapter under its own platform type, replacing any previous one.
    pub fn insert(&self, adapter: Arc<dyn PlatformAdapter>) -> Option<Arc<dyn PlatformAdapter>> {
        let mut guard = self
            .adapters
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.insert(adapter.platform_type(), adapter)
    }

    pub fn remove(&self, platform: PlatformType) -> Option<Arc<dyn PlatformAdapter>> {
        let mut guard = self
            .adapters
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.remove(&platform)
    }

    pub fn platforms(&self) -> Vec<PlatformType> {
        let guard = self
            .adapters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut platforms: Vec<PlatformType> = guard.keys().copied().collect();
        platforms.sort();
        platforms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NormalizedMessage, WebhookAuth};
    use anyhow::Result;

    struct NullAdapter(PlatformType);

    #[async_trait::async_trait]
    impl PlatformAdapter for NullAdapter {
        fn platform_type(&self) -> PlatformType {
            self.0
        }

        fn parse_incoming(&self, _payload: &[u8]) -> Option<NormalizedMessage> {
            None
        }

        async fn send(&self, _platform_user_id: &str, _text: &str) -> Result<()> {
            Ok(())
        }

        fn validate_signature(&self, _auth: &WebhookAuth) -> bool {
            true
        }
    }

    #[test]
    fn insert_replaces_and_remove_drops_by_platform() {
        let registry = AdapterRegistry::new();
        assert!(registry.get(PlatformType::Telegram).is_none());

        assert!(registry.insert(Arc::new(NullAdapter(PlatformType::Telegram))).is_none());
        assert!(registry.insert(Arc::new(NullAdapter(PlatformType::Wechat))).is_none());
        assert!(registry.insert(Arc::new(NullAdapter(PlatformType::Telegram))).is_some());
        assert_eq!(
            registry.platforms(),
            vec![PlatformType::Telegram, PlatformType::Wechat]
        );

        let clone = registry.clone();
        assert!(clone.remove(PlatformType::Wechat).is_some());
        assert!(registry.get(PlatformType::Wechat).is_none());
        assert_eq!(
            registry.get(PlatformType::Telegram).map(|a| a.platform_type()),
            Some(PlatformType::Telegram)
        );
    }
}
