//! Image compositing used to prepare stage-2 inputs and display previews.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;

use crate::error::{Result, TryOnError};

/// Letterbox `bytes` onto a `target_w × target_h` canvas filled with
/// `background`, preserving aspect ratio. Returns PNG bytes.
pub fn resize_image_with_padding(
    bytes: &[u8],
    target_w: u32,
    target_h: u32,
    background: Rgba<u8>,
) -> Result<Vec<u8>> {
    if target_w == 0 || target_h == 0 {
        return Err(TryOnError::Validation(format!(
            "Padding target must be non-empty, got {}x{}",
            target_w, target_h
        )));
    }
    let src = image::load_from_memory(bytes)?;
    let (sw, sh) = (src.width(), src.height());
    let (dw, dh, dx, dy) = fit_within(sw, sh, target_w, target_h);

    let scaled = src.resize_exact(dw, dh, FilterType::Lanczos3).to_rgba8();
    let mut canvas = RgbaImage::from_pixel(target_w, target_h, background);
    imageops::overlay(&mut canvas, &scaled, dx as i64, dy as i64);

    encode_png(&DynamicImage::ImageRgba8(canvas))
}

/// Scaled size and top-left offset of a `sw × sh` image centred in
/// `tw × th` with a uniform scale factor.
pub fn fit_within(sw: u32, sh: u32, tw: u32, th: u32) -> (u32, u32, u32, u32) {
    let scale = (tw as f64 / sw as f64).min(th as f64 / sh as f64);
    let dw = ((sw as f64 * scale).round() as u32).clamp(1, tw);
    let dh = ((sh as f64 * scale).round() as u32).clamp(1, th);
    let dx = (tw - dw) / 2;
    let dy = (th - dh) / 2;
    (dw, dh, dx, dy)
}

/// Pixel dimensions of an encoded image without a full decode.
pub fn image_dimensions(bytes: &[u8]) -> Result<(u32, u32)> {
    let reader = image::ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    Ok(reader.into_dimensions()?)
}

/// Shrink an image to fit a `max_w × max_h` box as JPEG. Images already
/// inside the box keep their size.
pub fn downscale_to_fit(bytes: &[u8], max_w: u32, max_h: u32, quality: u8) -> Result<Vec<u8>> {
    let src = image::load_from_memory(bytes)?;
    let scale = (max_w.max(1) as f64 / src.width() as f64)
        .min(max_h.max(1) as f64 / src.height() as f64)
        .min(1.0);
    let w = ((src.width() as f64 * scale).floor() as u32).max(1);
    let h = ((src.height() as f64 * scale).floor() as u32).max(1);
    let resized = if (w, h) == (src.width(), src.height()) {
        src
    } else {
        src.resize_exact(w, h, FilterType::Triangle)
    };

    let mut out = Vec::new();
    let rgb = resized.to_rgb8();
    JpegEncoder::new_with_quality(&mut out, quality).encode_image(&rgb)?;
    Ok(out)
}

/// Parse `#rgb`, `#rrggbb` or `#rrggbbaa`.
pub fn parse_hex_color(s: &str) -> Result<Rgba<u8>> {
    let hex = s.trim().trim_start_matches('#');
    let bad = || TryOnError::Validation(format!("Invalid colour '{}'", s));
    if !hex.is_ascii() {
        return Err(bad());
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| bad());
    match hex.len() {
        3 => {
            let mut px = [0u8, 0, 0, 255];
            for (i, c) in hex.chars().enumerate() {
                let v = c.to_digit(16).ok_or_else(bad)? as u8;
                px[i] = v * 17;
            }
            Ok(Rgba(px))
        }
        6 => Ok(Rgba([channel(0)?, channel(2)?, channel(4)?, 255])),
        8 => Ok(Rgba([channel(0)?, channel(2)?, channel(4)?, channel(6)?])),
        _ => Err(bad()),
    }
}

fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}
