use std::io::Cursor;

use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, IndexOp, Tensor};
use image::{DynamicImage, ImageFormat};
use tracing::{info, warn};

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    let device = match device_map {
        DeviceMap::ForceCpu => Device::Cpu,
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Device::new_cuda(ordinal)?,
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Device::new_metal(ordinal)?,
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            warn!("running on CPU, to run on GPU(metal), build with `--features metal`");
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            warn!("running on CPU, to run on GPU, build with `--features cuda`");
            Device::Cpu
        }
    };
    info!(?device, "selected device");
    Ok(device)
}

/// Converts a tensor with shape (3, height, width) of `u8` into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Maps vision-decoder output of shape (1, 3, height, width) in `[-1, 1]` to 8-bit pixels.
pub fn decoded_to_image(decoded: &Tensor) -> Result<DynamicImage> {
    let img = decoded
        .to_dtype(DType::F32)?
        .affine(127.5, 127.5)?
        .clamp(0f32, 255f32)?
        .to_dtype(DType::U8)?;
    tensor_to_image(&img.i(0)?)
}

pub fn encode_jpeg(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.to_rgb8()
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)?;
    Ok(bytes)
}
