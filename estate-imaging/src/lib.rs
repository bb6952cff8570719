// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Deterministic watermark crop, translating the original OpenCV
//! contour-detection pipeline (`crop_watermark_from_image` /
//! `detect_watermark_in_corner`) to the `image` + `imageproc` crates:
//! `cv2.threshold`/`cv2.adaptiveThreshold` become hand-rolled and
//! `imageproc::contrast::adaptive_threshold` passes respectively,
//! `cv2.findContours`/`cv2.contourArea`/`cv2.boundingRect` become
//! `imageproc::contours::find_contours` plus a shoelace-area helper.

use estate_error::{make_err, Code, Error};
use image::{DynamicImage, GenericImageView, GrayImage, ImageFormat, Luma};
use imageproc::contours::{find_contours, Contour};
use imageproc::point::Point;
use std::io::Cursor;

const THRESHOLD_MIN: u8 = 100;
const THRESHOLD_MAX: u8 = 250;
const THRESHOLD_STEP: u8 = 10;
const MIN_AREA: f64 = 20.0;
const MAX_AREA: f64 = 3000.0;
const DEFAULT_CROP_PX: u32 = 20;
const ADAPTIVE_BLOCK_RADIUS: u32 = 5; // blockSize 11 == radius 5.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Corner {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

#[derive(Debug, Clone, Copy)]
struct BoundingBox {
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    area: f64,
}

/// Decodes `image_bytes`, removes top/bottom watermark bands, and
/// re-encodes as JPEG. Fails only if the input is undecodable or empty;
/// a successful decode always produces output (worst case: the
/// original bytes, re-encoded, if no watermark is found or cropping
/// would empty the image).
pub fn crop(image_bytes: &[u8]) -> Result<Vec<u8>, Error> {
    if image_bytes.is_empty() {
        return Err(make_err!(Code::InvalidArgument, "empty image buffer"));
    }
    let decoded = image::load_from_memory(image_bytes)
        .map_err(|e| make_err!(Code::InvalidArgument, "undecodable image: {e}"))?;

    let (width, height) = decoded.dimensions();
    if width == 0 || height == 0 {
        return Err(make_err!(Code::InvalidArgument, "image has zero dimension"));
    }

    let gray = decoded.to_luma8();

    let top_crop = detect_band(&gray, &[Corner::TopLeft, Corner::TopRight])
        .map(|bbox| bbox.h)
        .unwrap_or(DEFAULT_CROP_PX)
        .min(height / 2);
    let bottom_crop = detect_band(&gray, &[Corner::BottomLeft, Corner::BottomRight])
        .map(|bbox| bbox.h)
        .unwrap_or(DEFAULT_CROP_PX)
        .min(height / 2);

    let new_top = top_crop;
    let new_bottom = height.saturating_sub(bottom_crop);

    let cropped = if new_top < new_bottom {
        decoded.crop_imm(0, new_top, width, new_bottom - new_top)
    } else {
        // Cropping would empty or invert the image; keep it unchanged.
        decoded
    };

    encode_jpeg(&cropped)
}

/// Runs the two-pass detection strategy for whichever of the two
/// corners in `candidates` yields a hit first, preferring the
/// higher-area candidate when both corners produce one (mirrors the
/// spec's "order by area descending, keep highest" rule, a refinement
/// over the original's first-match-wins short circuit).
fn detect_band(gray: &GrayImage, candidates: &[Corner]) -> Option<BoundingBox> {
    candidates
        .iter()
        .filter_map(|corner| detect_watermark_in_corner(gray, *corner))
        .max_by(|a, b| a.area.partial_cmp(&b.area).unwrap_or(std::cmp::Ordering::Equal))
}

fn detect_watermark_in_corner(gray: &GrayImage, corner: Corner) -> Option<BoundingBox> {
    let (width, height) = gray.dimensions();
    let margin = width.min(height) / 4;

    let mut candidates = Vec::new();
    let mut threshold = THRESHOLD_MIN;
    while threshold <= THRESHOLD_MAX {
        let binary = threshold_inverse(gray, threshold);
        candidates.extend(contours_in_range(&binary));
        threshold = threshold.saturating_add(THRESHOLD_STEP);
    }

    if candidates.is_empty() {
        let adaptive = imageproc::contrast::adaptive_threshold(gray, ADAPTIVE_BLOCK_RADIUS);
        // `adaptive_threshold` marks foreground as bright; the original
        // inverse-binary pass treats the watermark glyph as foreground,
        // so invert to match.
        let inverted = invert(&adaptive);
        candidates.extend(contours_in_range(&inverted));
    }

    candidates.sort_by(|a, b| b.area.partial_cmp(&a.area).unwrap_or(std::cmp::Ordering::Equal));

    candidates.into_iter().find(|bbox| in_corner_margin(bbox, corner, width, height, margin))
}

fn in_corner_margin(bbox: &BoundingBox, corner: Corner, width: u32, height: u32, margin: u32) -> bool {
    match corner {
        Corner::TopLeft => bbox.x < margin && bbox.y < margin,
        Corner::TopRight => bbox.x + bbox.w + margin >= width && bbox.y < margin,
        Corner::BottomLeft => bbox.x < margin && bbox.y + bbox.h + margin >= height,
        Corner::BottomRight => bbox.x + bbox.w + margin >= width && bbox.y + bbox.h + margin >= height,
    }
}

fn threshold_inverse(gray: &GrayImage, threshold: u8) -> GrayImage {
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let Luma([v]) = *gray.get_pixel(x, y);
        if v < threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

fn invert(gray: &GrayImage) -> GrayImage {
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let Luma([v]) = *gray.get_pixel(x, y);
        Luma([255 - v])
    })
}

fn contours_in_range(binary: &GrayImage) -> Vec<BoundingBox> {
    find_contours::<i32>(binary)
        .into_iter()
        .filter_map(|contour| bounding_box(&contour))
        .filter(|bbox| bbox.area >= MIN_AREA && bbox.area <= MAX_AREA)
        .collect()
}

fn bounding_box(contour: &Contour<i32>) -> Option<BoundingBox> {
    if contour.points.is_empty() {
        return None;
    }
    let (min_x, max_x, min_y, max_y) = contour.points.iter().fold(
        (i32::MAX, i32::MIN, i32::MAX, i32::MIN),
        |(min_x, max_x, min_y, max_y), p| (min_x.min(p.x), max_x.max(p.x), min_y.min(p.y), max_y.max(p.y)),
    );
    let area = polygon_area(&contour.points);
    Some(BoundingBox {
        x: min_x.max(0) as u32,
        y: min_y.max(0) as u32,
        w: (max_x - min_x + 1).max(0) as u32,
        h: (max_y - min_y + 1).max(0) as u32,
        area,
    })
}

/// Shoelace formula; the direct analogue of `cv2.contourArea` for a
/// closed integer polygon.
fn polygon_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut sum = 0i64;
    for i in 0..points.len() {
        let p0 = points[i];
        let p1 = points[(i + 1) % points.len()];
        sum += i64::from(p0.x) * i64::from(p1.y) - i64::from(p1.x) * i64::from(p0.y);
    }
    (sum.unsigned_abs() as f64) / 2.0
}

fn encode_jpeg(img: &DynamicImage) -> Result<Vec<u8>, Error> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Jpeg)
        .map_err(|e| make_err!(Code::Internal, "failed to encode cropped image as JPEG: {e}"))?;
    Ok(buf.into_inner())
}
