use std::future::Future;

use anyhow::Result;
use hf_hub::api::tokio::Api;

use crate::{DeviceMap, ModelVariant, MultiModalModel};

/// Fetches weights for one model family from the hub and builds it on the requested device.
pub trait Loader {
    type Model: MultiModalModel;

    fn load(
        variant: ModelVariant,
        api: Api,
        device_map: DeviceMap,
    ) -> impl Future<Output = Result<Self::Model>> + Send
    where
        Self: Sized;
}
