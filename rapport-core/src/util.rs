use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;
use image::DynamicImage;

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                tracing::warn!(
                    "Running on CPU, to run on GPU(metal), build with `--features metal`"
                );
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                tracing::warn!("Running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Normalizes any decoded image to 8-bit, 3-channel RGB.
pub fn to_rgb8(img: DynamicImage) -> DynamicImage {
    match img {
        DynamicImage::ImageRgb8(_) => img,
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ColorType, GrayImage, RgbaImage};

    #[test]
    fn grayscale_and_rgba_become_rgb() {
        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(2, 2, image::Luma([7])));
        let rgb = to_rgb8(gray);
        assert_eq!(rgb.color(), ColorType::Rgb8);
        assert_eq!(rgb.to_rgb8().get_pixel(1, 1).0, [7, 7, 7]);

        let rgba = DynamicImage::ImageRgba8(RgbaImage::from_pixel(3, 1, image::Rgba([1, 2, 3, 4])));
        let rgb = to_rgb8(rgba);
        assert_eq!(rgb.color(), ColorType::Rgb8);
        assert_eq!((rgb.width(), rgb.height()), (3, 1));
    }

    #[test]
    fn forced_cpu_is_cpu() {
        assert!(select_best_device(DeviceMap::ForceCpu).unwrap().is_cpu());
    }
}
