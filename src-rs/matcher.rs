//! Template matching against full-screen captures.
//!
//! Scores are zero-mean normalised cross-correlation over 8-bit grayscale
//! pixels, so a perfect match is 1.0 regardless of brightness offset or
//! contrast scaling. Large templates are searched coarse-to-fine.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage};
use serde::Serialize;

pub const DEFAULT_CONFIDENCE: f64 = 0.9;

const PYRAMID_MIN_SIDE: u32 = 12;
const COARSE_CANDIDATES: usize = 8;
const EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Region {
    pub fn center(&self) -> (u32, u32) {
        (self.x + self.w / 2, self.y + self.h / 2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Match {
    pub region: Region,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct TemplateMatcher {
    exhaustive: bool,
}

impl TemplateMatcher {
    pub fn new() -> Self {
        Self { exhaustive: false }
    }

    /// Scans every position at full resolution. Slow on large captures.
    pub fn exhaustive() -> Self {
        Self { exhaustive: true }
    }

    /// Best match whose score meets `confidence`, if any.
    pub fn locate(
        &self,
        capture: &DynamicImage,
        template: &DynamicImage,
        confidence: f64,
    ) -> Option<Match> {
        self.best_match(capture, template)
            .filter(|found| found.score >= confidence)
    }

    /// Highest scoring position regardless of threshold.
    pub fn best_match(&self, capture: &DynamicImage, template: &DynamicImage) -> Option<Match> {
        self.best_match_gray(&capture.to_luma8(), &template.to_luma8())
    }

    pub fn best_match_gray(&self, screen: &GrayImage, template: &GrayImage) -> Option<Match> {
        let (sw, sh) = screen.dimensions();
        let (tw, th) = template.dimensions();
        if tw == 0 || th == 0 || tw > sw || th > sh {
            return None;
        }

        let plane = Plane::new(screen);
        let stats = TemplateStats::new(template);
        // Flat templates score from the integral tables alone, so a full scan is cheap.
        let factor = if self.exhaustive || stats.energy <= EPSILON {
            1
        } else {
            pyramid_factor(tw, th)
        };
        if factor == 1 {
            return scan(&plane, &stats, 0, sw - tw, 0, sh - th);
        }

        let coarse_screen = imageops::resize(screen, sw / factor, sh / factor, FilterType::Triangle);
        let coarse_template =
            imageops::resize(template, tw / factor, th / factor, FilterType::Triangle);
        let coarse_plane = Plane::new(&coarse_screen);
        let coarse_stats = TemplateStats::new(&coarse_template);
        if coarse_stats.w > coarse_plane.w || coarse_stats.h > coarse_plane.h {
            return scan(&plane, &stats, 0, sw - tw, 0, sh - th);
        }

        let pad = factor + 1;
        let mut best: Option<Match> = None;
        for (cx, cy) in coarse_candidates(&coarse_plane, &coarse_stats, COARSE_CANDIDATES) {
            let x0 = (cx * factor).saturating_sub(pad);
            let y0 = (cy * factor).saturating_sub(pad);
            let x1 = (cx * factor + pad).min(sw - tw);
            let y1 = (cy * factor + pad).min(sh - th);
            if x0 > x1 || y0 > y1 {
                continue;
            }
            if let Some(found) = scan(&plane, &stats, x0, x1, y0, y1) {
                if best.map_or(true, |current| found.score > current.score) {
                    best = Some(found);
                }
            }
        }
        best
    }
}

/// Downscale used for the coarse pass. A full-resolution scan costs about
/// `sw * sh * tw * th`, so even small buttons on a full-HD capture take the
/// pyramid; only templates too small to survive halving scan directly.
fn pyramid_factor(tw: u32, th: u32) -> u32 {
    let side = tw.min(th);
    if side < PYRAMID_MIN_SIDE {
        1
    } else {
        (side / 12).clamp(2, 4)
    }
}

/// Grayscale pixels with summed-area tables for window mean/variance.
struct Plane {
    w: u32,
    h: u32,
    pixels: Vec<f64>,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
}

impl Plane {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = image.dimensions();
        let pixels: Vec<f64> = image.as_raw().iter().map(|&v| f64::from(v)).collect();
        let stride = (w + 1) as usize;
        let mut sum = vec![0.0; stride * (h + 1) as usize];
        let mut sum_sq = vec![0.0; stride * (h + 1) as usize];
        for y in 0..h as usize {
            let mut row = 0.0;
            let mut row_sq = 0.0;
            for x in 0..w as usize {
                let v = pixels[y * w as usize + x];
                row += v;
                row_sq += v * v;
                let idx = (y + 1) * stride + x + 1;
                sum[idx] = sum[idx - stride] + row;
                sum_sq[idx] = sum_sq[idx - stride] + row_sq;
            }
        }
        Self {
            w,
            h,
            pixels,
            sum,
            sum_sq,
        }
    }

    fn window(&self, x: u32, y: u32, w: u32, h: u32) -> (f64, f64) {
        let stride = (self.w + 1) as usize;
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = ((x + w) as usize, (y + h) as usize);
        let area = |table: &[f64]| {
            table[y1 * stride + x1] - table[y0 * stride + x1] - table[y1 * stride + x0]
                + table[y0 * stride + x0]
        };
        (area(&self.sum), area(&self.sum_sq))
    }
}

struct TemplateStats {
    w: u32,
    h: u32,
    centered: Vec<f64>,
    mean: f64,
    energy: f64,
}

impl TemplateStats {
    fn new(template: &GrayImage) -> Self {
        let (w, h) = template.dimensions();
        let raw = template.as_raw();
        let n = raw.len().max(1) as f64;
        let mean = raw.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
        let centered: Vec<f64> = raw.iter().map(|&v| f64::from(v) - mean).collect();
        let energy = centered.iter().map(|v| v * v).sum();
        Self {
            w,
            h,
            centered,
            mean,
            energy,
        }
    }
}

fn score_at(plane: &Plane, stats: &TemplateStats, x: u32, y: u32) -> f64 {
    let n = f64::from(stats.w * stats.h);
    let (sum, sum_sq) = plane.window(x, y, stats.w, stats.h);
    let variance = sum_sq - sum * sum / n;

    if stats.energy <= EPSILON {
        // Flat template: only flat windows can match, scored by brightness proximity.
        if variance / n > 1.0 {
            return 0.0;
        }
        return 1.0 - ((sum / n) - stats.mean).abs() / 255.0;
    }
    if variance <= EPSILON {
        return 0.0;
    }

    let mut dot = 0.0;
    for row in 0..stats.h {
        let base = ((y + row) * plane.w + x) as usize;
        let t_base = (row * stats.w) as usize;
        let window = &plane.pixels[base..base + stats.w as usize];
        let t_row = &stats.centered[t_base..t_base + stats.w as usize];
        dot += window.iter().zip(t_row).map(|(p, t)| p * t).sum::<f64>();
    }
    dot / (stats.energy * variance).sqrt()
}

/// Row-major scan over an inclusive position range; ties keep the first position.
fn scan(plane: &Plane, stats: &TemplateStats, x0: u32, x1: u32, y0: u32, y1: u32) -> Option<Match> {
    let mut best: Option<Match> = None;
    for y in y0..=y1 {
        for x in x0..=x1 {
            let score = score_at(plane, stats, x, y);
            if best.map_or(true, |current| score > current.score) {
                best = Some(Match {
                    region: Region {
                        x,
                        y,
                        w: stats.w,
                        h: stats.h,
                    },
                    score,
                });
            }
        }
    }
    best
}

fn coarse_candidates(plane: &Plane, stats: &TemplateStats, limit: usize) -> Vec<(u32, u32)> {
    let mut scored = Vec::with_capacity(((plane.w - stats.w + 1) * (plane.h - stats.h + 1)) as usize);
    for y in 0..=plane.h - stats.h {
        for x in 0..=plane.w - stats.w {
            scored.push((score_at(plane, stats, x, y), y, x));
        }
    }
    scored.sort_by(|a, b| {
        b.0.total_cmp(&a.0)
            .then(a.1.cmp(&b.1))
            .then(a.2.cmp(&b.2))
    });

    // Suppress neighbours of an already picked peak.
    let (min_dx, min_dy) = ((stats.w / 2).max(1), (stats.h / 2).max(1));
    let mut picked: Vec<(u32, u32)> = Vec::with_capacity(limit);
    for (_, y, x) in scored {
        if picked.len() >= limit {
            break;
        }
        let near = picked
            .iter()
            .any(|&(px, py)| px.abs_diff(x) < min_dx && py.abs_diff(y) < min_dy);
        if !near {
            picked.push((x, y));
        }
    }
    picked
}


#[cfg(test)]
mod tests {
    use super::fixtures::{blocky, with_template};
    use super::*;
    use image::Luma;

    #[test]
    fn finds_template_with_pyramid_search() {
        let background = blocky(640, 360, 8, 1);
        let template = blocky(48, 48, 8, 2);
        let frame = with_template(&background, &template, 200, 120);

        let found = TemplateMatcher::new()
            .locate(
                &DynamicImage::ImageLuma8(frame),
                &DynamicImage::ImageLuma8(template),
                DEFAULT_CONFIDENCE,
            )
            .expect("template should be found");
        assert_eq!(found.region, Region { x: 200, y: 120, w: 48, h: 48 });
        assert!(found.score > 0.99);
        assert_eq!(found.region.center(), (224, 144));
    }

    #[test]
    fn small_templates_still_use_the_pyramid() {
        assert_eq!(pyramid_factor(8, 8), 1);
        assert_eq!(pyramid_factor(12, 40), 2);
        assert_eq!(pyramid_factor(16, 16), 2);
        assert_eq!(pyramid_factor(23, 30), 2);
        assert_eq!(pyramid_factor(36, 36), 3);
        assert_eq!(pyramid_factor(120, 90), 4);
    }

    #[test]
    fn finds_small_button_through_pyramid() {
        let background = blocky(320, 180, 4, 5);
        let template = blocky(16, 16, 4, 6);
        let frame = with_template(&background, &template, 96, 64);

        let found = TemplateMatcher::new()
            .locate(
                &DynamicImage::ImageLuma8(frame),
                &DynamicImage::ImageLuma8(template),
                DEFAULT_CONFIDENCE,
            )
            .expect("small template should be found");
        assert_eq!(found.region, Region { x: 96, y: 64, w: 16, h: 16 });
        assert!(found.score > 0.99);
    }

    #[test]
    fn exhaustive_search_handles_unaligned_position() {
        let background = blocky(160, 100, 4, 3);
        let template = blocky(20, 20, 4, 4);
        let frame = with_template(&background, &template, 37, 21);

        let found = TemplateMatcher::exhaustive()
            .locate(
                &DynamicImage::ImageLuma8(frame),
                &DynamicImage::ImageLuma8(template),
                DEFAULT_CONFIDENCE,
            )
            .unwrap();
        assert_eq!((found.region.x, found.region.y), (37, 21));
    }

    #[test]
    fn absent_template_is_not_found() {
        let frame = blocky(320, 180, 4, 5);
        let template = blocky(32, 32, 4, 6);
        let found = TemplateMatcher::new().locate(
            &DynamicImage::ImageLuma8(frame),
            &DynamicImage::ImageLuma8(template),
            DEFAULT_CONFIDENCE,
        );
        assert!(found.is_none());
    }

    #[test]
    fn threshold_above_best_score_rejects_match() {
        let background = blocky(320, 180, 8, 7);
        let template = blocky(32, 32, 8, 8);
        let frame = DynamicImage::ImageLuma8(with_template(&background, &template, 64, 32));
        let template = DynamicImage::ImageLuma8(template);
        let matcher = TemplateMatcher::new();
        assert!(matcher.locate(&frame, &template, 0.95).is_some());
        assert!(matcher.locate(&frame, &template, 1.01).is_none());
    }

    #[test]
    fn identical_inputs_give_identical_results() {
        let background = blocky(320, 180, 8, 9);
        let template = blocky(32, 32, 8, 10);
        let frame = DynamicImage::ImageLuma8(with_template(&background, &template, 128, 64));
        let template = DynamicImage::ImageLuma8(template);
        let matcher = TemplateMatcher::new();
        let first = matcher.best_match(&frame, &template);
        let second = matcher.best_match(&frame, &template);
        assert_eq!(first, second);

        let noise = DynamicImage::ImageLuma8(blocky(320, 180, 8, 11));
        assert_eq!(
            matcher.locate(&noise, &template, 0.9),
            matcher.locate(&noise, &template, 0.9)
        );
    }

    #[test]
    fn template_larger_than_capture_is_rejected() {
        let frame = DynamicImage::ImageLuma8(blocky(16, 16, 4, 12));
        let template = DynamicImage::ImageLuma8(blocky(32, 32, 4, 13));
        assert!(TemplateMatcher::new().best_match(&frame, &template).is_none());
    }

    #[test]
    fn flat_template_matches_flat_area_of_same_brightness() {
        let mut frame = blocky(64, 64, 8, 14);
        for y in 8..24 {
            for x in 40..56 {
                frame.put_pixel(x, y, Luma([200]));
            }
        }
        let template = GrayImage::from_pixel(16, 16, Luma([200]));
        let found = TemplateMatcher::new()
            .best_match_gray(&frame, &template)
            .unwrap();
        assert_eq!((found.region.x, found.region.y), (40, 8));
        assert!((found.score - 1.0).abs() < 1e-9);
    }
}
