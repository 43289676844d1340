use anyhow::Result;
use dlib_face_recognition::ImageMatrix;
use image::buffer::ConvertBuffer;
use image::{DynamicImage, GenericImageView, Luma};
use rscam::Frame;

pub type GrayFrameImage = image::ImageBuffer<image::Luma<u8>, Frame>;

/// Wrap a raw camera frame (GREY format) into an image buffer without copying.
pub fn frame_to_gray(frame: Frame) -> Result<GrayFrameImage> {
    image::ImageBuffer::<image::Luma<u8>, _>::from_raw(
        frame.resolution.0,
        frame.resolution.1,
        frame,
    )
    .ok_or(anyhow::anyhow!("no img from cam frame"))
}

pub fn to_rgb(img: &GrayFrameImage) -> DynamicImage {
    DynamicImage::ImageRgb8(img.convert())
}

pub fn center_crop(
    img: &impl GenericImageView<Pixel = Luma<u8>>,
) -> image::SubImage<&impl GenericImageView<Pixel = Luma<u8>>> {
    let (w, h) = img.dimensions();
    assert!(w >= h, "portrait image not supported");
    let x = (w - h) / 2;
    image::imageops::crop_imm(img, x, 0, h, h)
}

/// Low-light guard: true when at least `threshold_percent` of the center
/// crop falls in the darkest histogram bin. Dark frames are skipped before
/// extraction is even attempted.
pub fn is_dark(img: &impl GenericImageView<Pixel = Luma<u8>>, threshold_percent: u32) -> bool {
    let cropped = center_crop(img);
    let hist = gen_hist::<12>(cropped.inner());
    let total: u32 = hist.iter().sum();
    let dark_percent = (hist[0] * 100) / total;
    dark_percent >= threshold_percent
}

/// Resize to target width preserving the aspect ratio.
pub fn resize_to_width(img: &DynamicImage, target_width: u32) -> DynamicImage {
    let w = img.width();
    let aspect_ratio = w as f64 / img.height() as f64;
    let target_height = (target_width as f64 / aspect_ratio).round() as u32;
    img.resize(
        target_width,
        target_height,
        image::imageops::FilterType::Nearest,
    )
}

pub fn img_to_dlib(img: &DynamicImage) -> Result<ImageMatrix> {
    Ok(ImageMatrix::from_image(&img.to_rgb8()))
}

const fn int_ceil(a: usize, b: usize) -> usize {
    (a - 1) / b + 1
}

const fn bin<const BINS: usize>(val: u8) -> usize {
    let per_bin: u8 = int_ceil(u8::MAX as usize, BINS) as u8;
    (val / per_bin) as usize
}

/// Histogram of a grayscale image.
fn gen_hist<const BINS: usize>(img: &impl GenericImageView<Pixel = Luma<u8>>) -> [u32; BINS] {
    let mut hist = [0; BINS];
    for (_, _, p) in img.pixels() {
        hist[bin::<BINS>(p.0[0])] += 1;
    }
    hist
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(w: u32, h: u32, v: u8) -> image::GrayImage {
        image::GrayImage::from_pixel(w, h, Luma([v]))
    }

    #[test]
    fn black_frame_is_dark() {
        assert!(is_dark(&flat(64, 48, 0), 30));
    }

    #[test]
    fn bright_frame_is_not_dark() {
        assert!(!is_dark(&flat(64, 48, 200), 30));
    }

    #[test]
    fn resize_preserves_aspect_ratio() {
        let img = DynamicImage::ImageLuma8(flat(640, 480, 128));
        let out = resize_to_width(&img, 320);
        assert_eq!(out.width(), 320);
        assert_eq!(out.height(), 240);
    }
}
