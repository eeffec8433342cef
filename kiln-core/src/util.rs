use std::io::Cursor;

use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Tensor};
use image::DynamicImage;
use tracing::info;

use crate::{ClientError, DeviceMap};

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                info!("Running on CPU, to run on GPU(metal), build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                info!("Running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// The device `select_best_device` would pick, without allocating it.
pub fn device_label(device_map: DeviceMap) -> String {
    match device_map {
        DeviceMap::ForceCpu => "cpu".to_string(),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => format!("cuda:{ordinal}"),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => format!("metal:{ordinal}"),
        DeviceMap::Ordinal(_) => "cpu".to_string(),
    }
}

pub fn cuda_available() -> bool {
    cuda_is_available()
}

/// Converts a tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Decodes an uploaded image and normalises it to RGB8.
pub fn decode_image(bytes: &[u8]) -> std::result::Result<DynamicImage, ClientError> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| ClientError::malformed("file", format!("Invalid image file: {e}")))?;
    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_garbage_as_client_error() {
        let err = decode_image(b"definitely not an image").unwrap_err();
        assert_eq!(err.kind, crate::ClientErrorKind::Malformed);
        assert!(err.detail.starts_with("Invalid image file"));
    }

    #[test]
    fn png_encoding_decodes_back_to_same_dimensions() {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            24,
            16,
            image::Rgb([10, 20, 30]),
        ));
        let png = encode_png(&img).unwrap();
        let decoded = decode_image(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (24, 16));
    }

    #[test]
    fn tensor_to_image_requires_three_channels() {
        let t = Tensor::zeros((1, 4, 4), candle_core::DType::U8, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&t).is_err());
        let t = Tensor::zeros((3, 4, 5), candle_core::DType::U8, &Device::Cpu).unwrap();
        let img = tensor_to_image(&t).unwrap();
        assert_eq!((img.width(), img.height()), (5, 4));
    }
}
