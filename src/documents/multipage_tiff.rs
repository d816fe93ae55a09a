//! Multipage TIFF support.
//!
//! Each IFD in the main chain is one page. We decode the requested IFD and
//! re-encode it as PNG, because few OCR backends accept TIFF directly.
//!
//! These functions block, so call them via
//! [`crate::async_utils::spawn_blocking_propagating_panics`].

use std::{
    fs,
    io::{BufReader, Cursor, Read, Seek},
};

use image::{DynamicImage, GrayImage, ImageFormat, RgbImage, RgbaImage};
use tiff::{
    ColorType,
    decoder::{Decoder, DecodingResult},
};

use crate::prelude::*;

use super::PageImage;

/// Open a TIFF decoder positioned at the first IFD.
fn open_decoder(path: &Path) -> Result<Decoder<BufReader<fs::File>>> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open TIFF file {:?}", path.display()))?;
    Decoder::new(BufReader::new(file))
        .with_context(|| format!("failed to create TIFF decoder for {:?}", path.display()))
}

/// Count the IFDs in a TIFF file.
pub fn count_tiff_pages(path: &Path) -> Result<usize> {
    let mut decoder = open_decoder(path)?;
    let mut count = 1;
    while decoder.more_images() {
        decoder.next_image().with_context(|| {
            format!("failed to advance to IFD {} in {:?}", count, path.display())
        })?;
        count += 1;
    }
    Ok(count)
}

/// Decode one IFD of a TIFF file and encode it as PNG.
pub fn tiff_page_as_png(path: &Path, page_idx: usize) -> Result<PageImage> {
    let mut decoder = open_decoder(path)?;
    decoder.seek_to_image(page_idx).with_context(|| {
        format!("failed to seek to IFD {} in {:?}", page_idx, path.display())
    })?;
    let image = decode_current_ifd(&mut decoder)
        .with_context(|| format!("failed to decode IFD {} in {:?}", page_idx, path.display()))?;

    let mut png_bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)
        .with_context(|| {
            format!("failed to encode PNG for IFD {} in {:?}", page_idx, path.display())
        })?;
    Ok(PageImage::new("image/png", png_bytes))
}

/// Decode the current IFD to a [`DynamicImage`].
fn decode_current_ifd<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<DynamicImage> {
    let (width, height) = decoder.dimensions()?;
    let color_type = decoder.colortype()?;
    let result = decoder.read_image()?;

    // Apparently we need to do this the hard way.
    let data = match result {
        DecodingResult::U8(data) => data,
        // Drop the low byte of 16-bit samples.
        DecodingResult::U16(data) => data.iter().map(|&v| (v >> 8) as u8).collect(),
        _ => return Err(anyhow!("unsupported TIFF sample format")),
    };
    let size_error = || anyhow!("TIFF data does not match {width}x{height} {color_type:?}");
    let image = match color_type {
        ColorType::Gray(1) => {
            let gray = GrayImage::from_raw(width, height, unpack_bilevel(&data, width, height))
                .ok_or_else(size_error)?;
            DynamicImage::ImageLuma8(gray)
        }
        ColorType::Gray(8 | 16) => {
            DynamicImage::ImageLuma8(GrayImage::from_raw(width, height, data).ok_or_else(size_error)?)
        }
        ColorType::RGB(8 | 16) => {
            DynamicImage::ImageRgb8(RgbImage::from_raw(width, height, data).ok_or_else(size_error)?)
        }
        ColorType::RGBA(8 | 16) => DynamicImage::ImageRgba8(
            RgbaImage::from_raw(width, height, data).ok_or_else(size_error)?,
        ),
        other => return Err(anyhow!("unsupported TIFF color type {:?}", other)),
    };
    Ok(image)
}

/// Expand 1-bit rows (each padded to a whole byte) to 8-bit grayscale. The
/// decoder has already normalized the data so that a set bit is white.
fn unpack_bilevel(data: &[u8], width: u32, height: u32) -> Vec<u8> {
    let width = width as usize;
    let row_bytes = width.div_ceil(8);
    let mut pixels = Vec::with_capacity(width * height as usize);
    for row in data.chunks(row_bytes).take(height as usize) {
        for x in 0..width {
            let byte = row.get(x / 8).copied().unwrap_or(0);
            let bit = (byte >> (7 - (x % 8))) & 1;
            pixels.push(if bit == 1 { 255 } else { 0 });
        }
    }
    pixels
}
