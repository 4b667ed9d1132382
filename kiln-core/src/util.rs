use candle_core::{Error, Tensor};
use image::DynamicImage;

/// Converts a tensor with shape (3, height, width) into an image buffer.
pub(crate) fn tensor_to_image(img: &Tensor) -> candle_core::Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        candle_core::bail!("expected a 3-channel image tensor, got {channels}");
    }
    let pixels = img.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| Error::msg("pixel buffer does not match image dimensions"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}
