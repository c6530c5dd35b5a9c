//! Registry of encoder backends.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use super::{FfmpegProvider, Provider, ProviderError, ProviderInfo};
use crate::config::PipelineConfig;
use crate::params::TranscodeParams;

/// Providers in registration order.
///
/// Constructed at startup and passed to the components that need it;
/// `clear` tears it down on shutdown.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<Vec<Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configured hardware encoders first, then the software fallback.
    ///
    /// # Errors
    ///
    /// - `ProviderError::DuplicateProvider` - The same accelerator is listed twice
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ProviderError> {
        let registry = Self::new();
        for accel in &config.hardware {
            registry.register(Arc::new(FfmpegProvider::hardware(&config.ffmpeg_path, *accel)))?;
        }
        registry.register(Arc::new(FfmpegProvider::software(&config.ffmpeg_path)))?;
        Ok(registry)
    }

    /// Adds a provider.
    ///
    /// # Errors
    ///
    /// - `ProviderError::DuplicateProvider` - The id is already registered
    pub fn register(&self, provider: Arc<dyn Provider>) -> Result<(), ProviderError> {
        let mut providers = self.providers.write();
        let id = provider.info().id.clone();
        if providers.iter().any(|p| p.info().id == id) {
            return Err(ProviderError::DuplicateProvider { id });
        }
        info!(
            provider = %id,
            hardware = provider.info().hardware_accelerated,
            "Registered encoder provider"
        );
        providers.push(provider);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .read()
            .iter()
            .find(|p| p.info().id == id)
            .cloned()
    }

    pub fn list(&self) -> Vec<ProviderInfo> {
        self.providers.read().iter().map(|p| p.info().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }

    /// Capable providers, hardware-accelerated first, then registration order.
    ///
    /// # Errors
    ///
    /// - `ProviderError::NoCapableProvider` - Nothing matches
    pub fn find_capable(&self, params: &TranscodeParams) -> Result<Vec<ProviderInfo>, ProviderError> {
        Ok(self
            .capable(params)?
            .iter()
            .map(|p| p.info().clone())
            .collect())
    }

    /// Most preferred capable provider.
    pub fn select(&self, params: &TranscodeParams) -> Result<Arc<dyn Provider>, ProviderError> {
        self.capable(params)?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::no_capable(params))
    }

    fn capable(&self, params: &TranscodeParams) -> Result<Vec<Arc<dyn Provider>>, ProviderError> {
        let mut capable: Vec<_> = self
            .providers
            .read()
            .iter()
            .filter(|p| p.info().can_handle(params))
            .cloned()
            .collect();
        if capable.is_empty() {
            return Err(ProviderError::no_capable(params));
        }
        // Stable sort keeps registration order within each group
        capable.sort_by_key(|p| !p.info().hardware_accelerated);
        Ok(capable)
    }

    pub fn clear(&self) {
        self.providers.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::params::StreamingFormat;
    use crate::process::{ManagedProcess, ProcessError};
    use crate::provider::{EncodeJob, HardwareAccel};

    struct FakeProvider(ProviderInfo);

    #[async_trait]
    impl Provider for FakeProvider {
        fn info(&self) -> &ProviderInfo {
            &self.0
        }

        async fn start_encode(&self, _job: &EncodeJob) -> Result<ManagedProcess, ProcessError> {
            Err(ProcessError::NotFound {
                program: "fake".into(),
            })
        }
    }

    fn provider(id: &str, hardware: bool, video: &[&str]) -> Arc<dyn Provider> {
        Arc::new(FakeProvider(ProviderInfo {
            id: id.to_string(),
            name: id.to_string(),
            video_codecs: video.iter().map(|c| c.to_string()).collect(),
            audio_codecs: ["aac".to_string()].into(),
            containers: ["mp4".to_string()].into(),
            hardware_accelerated: hardware,
            max_concurrent: 1,
        }))
    }

    fn h264() -> TranscodeParams {
        TranscodeParams::new("m", "mp4", StreamingFormat::Dash)
            .with_video("h264", false)
            .with_audio("aac", false)
    }

    #[test]
    fn test_hardware_first_then_registration_order() {
        let registry = ProviderRegistry::new();
        registry.register(provider("sw-a", false, &["h264"])).unwrap();
        registry.register(provider("hw-a", true, &["h264"])).unwrap();
        registry.register(provider("sw-b", false, &["h264"])).unwrap();
        registry.register(provider("hw-b", true, &["h264"])).unwrap();
        registry.register(provider("vp9-only", true, &["vp9"])).unwrap();

        let ids: Vec<String> = registry
            .find_capable(&h264())
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, ["hw-a", "hw-b", "sw-a", "sw-b"]);
        assert_eq!(registry.select(&h264()).unwrap().info().id, "hw-a");
    }

    #[test]
    fn test_no_capable_provider() {
        let registry = ProviderRegistry::new();
        registry.register(provider("sw", false, &["h264"])).unwrap();

        let av1 = h264().with_video("av1", false);
        let err = registry.find_capable(&av1).unwrap_err();
        assert!(matches!(err, ProviderError::NoCapableProvider { ref video, .. } if video == "av1"));
        assert!(registry.select(&av1).is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let registry = ProviderRegistry::new();
        registry.register(provider("sw", false, &["h264"])).unwrap();
        assert_eq!(
            registry.register(provider("sw", true, &["hevc"])),
            Err(ProviderError::DuplicateProvider { id: "sw".into() })
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.get("sw").is_some());

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_from_config_orders_hardware_before_software() {
        let config = PipelineConfig {
            hardware: vec![HardwareAccel::Nvenc],
            ..PipelineConfig::default()
        };
        let registry = ProviderRegistry::from_config(&config).unwrap();
        let ids: Vec<String> = registry.list().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, ["ffmpeg-nvenc", "ffmpeg-software"]);

        let twice = PipelineConfig {
            hardware: vec![HardwareAccel::Qsv, HardwareAccel::Qsv],
            ..PipelineConfig::default()
        };
        assert!(ProviderRegistry::from_config(&twice).is_err());
    }
}
