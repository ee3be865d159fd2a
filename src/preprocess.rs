use std::io::Cursor;

use image::{DynamicImage, GrayImage, ImageBuffer, ImageOutputFormat, Luma, Rgb, RgbImage};
use imageproc::filter::median_filter;

use crate::error::SolveError;

const BRIGHTNESS_FACTOR: f32 = 2.0;
const CONTRAST_FACTOR: f32 = 3.0;
const MEDIAN_RADIUS: u32 = 1;
const BINARY_THRESHOLD: u8 = 160;

/// Decodes an uploaded captcha, runs [`preprocess`] and re-encodes the result as PNG.
pub fn preprocess_bytes(image_data: &[u8]) -> Result<Vec<u8>, SolveError> {
    let img = image::load_from_memory(image_data)?;
    let binary = preprocess(&img);
    Ok(encode_png(&binary)?)
}

/// Flattens, grays, enhances, denoises and binarizes a captcha.
///
/// Output has the input's dimensions and every pixel is either 0 or 255.
pub fn preprocess(img: &DynamicImage) -> GrayImage {
    let rgb = flatten_alpha(img);
    let gray = to_grayscale(&rgb);
    let brightened = enhance_brightness(&gray, BRIGHTNESS_FACTOR);
    let contrasted = enhance_contrast(&brightened, CONTRAST_FACTOR);
    let denoised = median_filter(&contrasted, MEDIAN_RADIUS, MEDIAN_RADIUS);
    binarize(&denoised, BINARY_THRESHOLD)
}

pub fn encode_png(img: &GrayImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    DynamicImage::ImageLuma8(img.clone())
        .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)?;
    Ok(buf)
}

/// Composites images with an alpha channel onto opaque white.
fn flatten_alpha(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }

    let rgba = img.to_rgba8();
    ImageBuffer::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        Rgb([over_white(r, a), over_white(g, a), over_white(b, a)])
    })
}

fn over_white(channel: u8, alpha: u8) -> u8 {
    // rounded (channel * a + 255 * (255 - a)) / 255
    let tmp = channel as u32 * alpha as u32 + 255 * (255 - alpha as u32) + 128;
    ((tmp + (tmp >> 8)) >> 8) as u8
}

/// ITU-R 601-2 luma in 16-bit fixed point.
fn to_grayscale(rgb: &RgbImage) -> GrayImage {
    ImageBuffer::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let l = r as u32 * 19595 + g as u32 * 38470 + b as u32 * 7471 + 0x8000;
        Luma([(l >> 16) as u8])
    })
}

/// Interpolates between `degenerate` and `value`, clipped to u8 range.
fn blend(degenerate: f32, value: u8, factor: f32) -> u8 {
    let v = degenerate + factor * (value as f32 - degenerate);
    v.clamp(0.0, 255.0) as u8
}

fn enhance_brightness(gray: &GrayImage, factor: f32) -> GrayImage {
    let mut out = gray.clone();
    for pixel in out.pixels_mut() {
        pixel.0[0] = blend(0.0, pixel.0[0], factor);
    }
    out
}

fn enhance_contrast(gray: &GrayImage, factor: f32) -> GrayImage {
    let mean = mean_intensity(gray) as f32;
    let mut out = gray.clone();
    for pixel in out.pixels_mut() {
        pixel.0[0] = blend(mean, pixel.0[0], factor);
    }
    out
}

/// Mean pixel value rounded half up.
fn mean_intensity(gray: &GrayImage) -> u8 {
    let count = gray.width() as u64 * gray.height() as u64;
    if count == 0 {
        return 0;
    }
    let sum: u64 = gray.pixels().map(|p| p.0[0] as u64).sum();
    (sum as f64 / count as f64 + 0.5) as u8
}

fn binarize(gray: &GrayImage, threshold: u8) -> GrayImage {
    ImageBuffer::from_fn(gray.width(), gray.height(), |x, y| {
        if gray.get_pixel(x, y).0[0] > threshold {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    })
}
