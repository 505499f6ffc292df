use anyhow::{anyhow, Result};
use hf_hub::api::tokio::Api;
use tracing::info;

use crate::{DeviceMap, JanusLoader, Loader, MultiModalModel};
use std::sync::Arc;

/// Model families recognised from a hub repository name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelType {
    Janus,
    JanusFlow,
}

impl ModelType {
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("JANUSFLOW") {
            Some(ModelType::JanusFlow)
        } else if name_upper.contains("JANUS") {
            Some(ModelType::Janus)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVariant {
    Janus1_3B,
    JanusPro1B,
    JanusPro7B,
}

impl ModelVariant {
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();
        if !name_upper.contains("JANUS") || name_upper.contains("JANUSFLOW") {
            return None;
        }

        Some(if name_upper.contains("PRO") && name_upper.contains("7B") {
            ModelVariant::JanusPro7B
        } else if name_upper.contains("PRO") {
            ModelVariant::JanusPro1B
        } else {
            ModelVariant::Janus1_3B
        })
    }

    pub fn repo_id(&self) -> &'static str {
        match self {
            ModelVariant::Janus1_3B => "deepseek-ai/Janus-1.3B",
            ModelVariant::JanusPro1B => "deepseek-ai/Janus-Pro-1B",
            ModelVariant::JanusPro7B => "deepseek-ai/Janus-Pro-7B",
        }
    }
}

/// Load a model based on its name, automatically detecting the appropriate loader
pub async fn load_model(
    model_name: &str,
    api: Api,
    device_map: DeviceMap,
) -> Result<Arc<dyn MultiModalModel>> {
    let model_type = ModelType::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model type: {}", model_name))?;

    match model_type {
        ModelType::Janus => {
            let model_variant = ModelVariant::from_name(model_name)
                .ok_or_else(|| anyhow!("Unsupported model variant: {}", model_name))?;
            info!(model_name, ?model_type, ?model_variant, "loading model");
            let model = JanusLoader::load(model_variant, api, device_map).await?;
            Ok(Arc::new(model))
        }
        ModelType::JanusFlow => Err(anyhow!(
            "Model type {:?} is recognized but not yet implemented",
            model_type
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_variants_from_repo_names() {
        assert_eq!(
            ModelVariant::from_name("deepseek-ai/Janus-1.3B"),
            Some(ModelVariant::Janus1_3B)
        );
        assert_eq!(
            ModelVariant::from_name("deepseek-ai/Janus-Pro-1B"),
            Some(ModelVariant::JanusPro1B)
        );
        assert_eq!(
            ModelVariant::from_name("deepseek-ai/Janus-Pro-7B"),
            Some(ModelVariant::JanusPro7B)
        );
        assert_eq!(ModelVariant::from_name("black-forest-labs/FLUX.1-schnell"), None);
        assert_eq!(ModelVariant::from_name("deepseek-ai/JanusFlow-1.3B"), None);
    }

    #[test]
    fn detects_model_types() {
        assert_eq!(ModelType::from_name("deepseek-ai/Janus-1.3B"), Some(ModelType::Janus));
        assert_eq!(
            ModelType::from_name("deepseek-ai/JanusFlow-1.3B"),
            Some(ModelType::JanusFlow)
        );
        assert_eq!(ModelType::from_name("openai/clip-vit-large-patch14"), None);
    }

    #[tokio::test]
    async fn rejects_unknown_and_unsupported_models() {
        let api = Api::new().unwrap();
        let err = load_model("openai/clip-vit-large-patch14", api.clone(), DeviceMap::ForceCpu)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("Unsupported model type"));

        let err = load_model("deepseek-ai/JanusFlow-1.3B", api, DeviceMap::ForceCpu)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("not yet implemented"));
    }
}
