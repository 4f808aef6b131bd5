//! Randomized geometric + photometric augmentation of one image and one box.
//!
//! A transform is sampled first as [`AugmentParams`], so the builder can map
//! the box (and drop degenerate results) before any pixels are decoded. The
//! same parameters are then applied to the image when it is written.

use image::{imageops, Rgb, RgbImage};
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::types::BoxXyxy;

/// Sub-rectangle of the (rotated) image kept by a crop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropWindow {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Occluded rectangle, in fractions of the output size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Occlusion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseParams {
    pub strength: f32,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorJitter {
    pub hue_degrees: i32,
    pub saturation: f32,
    pub brightness: f32,
}

/// One sampled transform. `Default` is the identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AugmentParams {
    pub flip: bool,
    /// `(brightness factor, contrast factor)`.
    pub brightness_contrast: Option<(f32, f32)>,
    pub rotation_degrees: Option<f64>,
    pub noise: Option<NoiseParams>,
    pub blur_sigma: Option<f32>,
    pub crop: Option<CropWindow>,
    pub occlusions: Vec<Occlusion>,
    pub color_jitter: Option<ColorJitter>,
    pub equalize: bool,
}

impl AugmentParams {
    pub fn output_size(&self, width: u32, height: u32) -> (u32, u32) {
        match self.crop {
            Some(crop) => (crop.width, crop.height),
            None => (width, height),
        }
    }

    /// Re-map a pixel box through flip, rotation and crop.
    /// `None` when nothing of the box survives.
    pub fn map_box(&self, bbox: BoxXyxy, width: u32, height: u32) -> Option<BoxXyxy> {
        let (w, h) = (width as f64, height as f64);
        let mut b = clip(bbox, w, h);

        if self.flip {
            b = [w - b[2], b[1], w - b[0], b[3]];
        }

        if let Some(degrees) = self.rotation_degrees {
            let (cx, cy) = (w / 2.0, h / 2.0);
            let corners = [(b[0], b[1]), (b[2], b[1]), (b[0], b[3]), (b[2], b[3])];
            let rotated = corners.map(|(x, y)| rotate_point(x, y, cx, cy, degrees));
            let xs = rotated.map(|p| p.0);
            let ys = rotated.map(|p| p.1);
            b = clip(
                [
                    xs.iter().copied().fold(f64::INFINITY, f64::min),
                    ys.iter().copied().fold(f64::INFINITY, f64::min),
                    xs.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                    ys.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                ],
                w,
                h,
            );
        }

        if let Some(crop) = self.crop {
            let (ox, oy) = (crop.x as f64, crop.y as f64);
            b = clip(
                [b[0] - ox, b[1] - oy, b[2] - ox, b[3] - oy],
                crop.width as f64,
                crop.height as f64,
            );
        }

        (b[2] > b[0] && b[3] > b[1]).then_some(b)
    }

    /// Apply the transform. Stages run in a fixed order; geometry matches [`map_box`](Self::map_box).
    pub fn apply(&self, mut img: RgbImage) -> RgbImage {
        if self.flip {
            imageops::flip_horizontal_in_place(&mut img);
        }
        if let Some((brightness, contrast)) = self.brightness_contrast {
            adjust_brightness_contrast(&mut img, brightness, contrast);
        }
        if let Some(degrees) = self.rotation_degrees {
            img = rotate_about_center(&img, degrees);
        }
        if let Some(noise) = self.noise {
            add_noise(&mut img, noise);
        }
        if let Some(sigma) = self.blur_sigma {
            img = imageops::blur(&img, sigma);
        }
        if let Some(crop) = self.crop {
            img = imageops::crop_imm(&img, crop.x, crop.y, crop.width, crop.height).to_image();
        }
        for occlusion in &self.occlusions {
            occlude(&mut img, occlusion);
        }
        if let Some(jitter) = self.color_jitter {
            img = jitter_color(&img, jitter);
        }
        if self.equalize {
            equalize(&mut img);
        }
        img
    }
}

/// Source of per-augmentation transforms.
pub trait Augmenter {
    fn sample(&mut self, width: u32, height: u32) -> AugmentParams;
}

/// Always the identity; augmented copies equal their source.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityAugmenter;

impl Augmenter for IdentityAugmenter {
    fn sample(&mut self, _width: u32, _height: u32) -> AugmentParams {
        AugmentParams::default()
    }
}

/// Activation probability and strength of each stage.
#[derive(Debug, Clone)]
pub struct AugmentConfig {
    pub flip_prob: f64,
    pub brightness_contrast_prob: f64,
    pub brightness_contrast_limit: f32,
    pub rotate_prob: f64,
    pub rotate_limit_degrees: f64,
    pub noise_prob: f64,
    pub noise_strength: f32,
    pub blur_prob: f64,
    pub blur_sigma_max: f32,
    pub crop_prob: f64,
    pub crop_size: (u32, u32),
    pub occlusion_prob: f64,
    pub max_occlusions: usize,
    pub color_jitter_prob: f64,
    pub equalize_prob: f64,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            flip_prob: 0.5,
            brightness_contrast_prob: 0.3,
            brightness_contrast_limit: 0.2,
            rotate_prob: 0.3,
            rotate_limit_degrees: 15.0,
            noise_prob: 0.2,
            noise_strength: 0.04,
            blur_prob: 0.2,
            blur_sigma_max: 2.0,
            crop_prob: 0.3,
            crop_size: (800, 800),
            occlusion_prob: 0.3,
            max_occlusions: 3,
            color_jitter_prob: 0.4,
            equalize_prob: 0.2,
        }
    }
}

/// Samples every stage independently with its own probability.
pub struct RandomAugmenter {
    config: AugmentConfig,
    rng: StdRng,
}

impl RandomAugmenter {
    pub fn new(config: AugmentConfig, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, rng }
    }
}

impl Augmenter for RandomAugmenter {
    fn sample(&mut self, width: u32, height: u32) -> AugmentParams {
        let cfg = &self.config;
        let rng = &mut self.rng;
        let mut params = AugmentParams {
            flip: rng.gen_bool(cfg.flip_prob),
            ..AugmentParams::default()
        };

        if rng.gen_bool(cfg.brightness_contrast_prob) {
            let limit = cfg.brightness_contrast_limit;
            params.brightness_contrast = Some((
                1.0 + rng.gen_range(-limit..=limit),
                1.0 + rng.gen_range(-limit..=limit),
            ));
        }
        if rng.gen_bool(cfg.rotate_prob) {
            let limit = cfg.rotate_limit_degrees;
            params.rotation_degrees = Some(rng.gen_range(-limit..=limit));
        }
        if rng.gen_bool(cfg.noise_prob) {
            params.noise = Some(NoiseParams {
                strength: cfg.noise_strength,
                seed: rng.gen(),
            });
        }
        if rng.gen_bool(cfg.blur_prob) {
            params.blur_sigma = Some(rng.gen_range(0.5..=cfg.blur_sigma_max.max(0.5)));
        }

        let (crop_w, crop_h) = cfg.crop_size;
        if rng.gen_bool(cfg.crop_prob) && width >= crop_w && height >= crop_h {
            params.crop = Some(CropWindow {
                x: rng.gen_range(0..=width - crop_w),
                y: rng.gen_range(0..=height - crop_h),
                width: crop_w,
                height: crop_h,
            });
        }
        if cfg.max_occlusions > 0 && rng.gen_bool(cfg.occlusion_prob) {
            let holes = rng.gen_range(1..=cfg.max_occlusions);
            params.occlusions = (0..holes)
                .map(|_| {
                    let width = rng.gen_range(0.05..=0.1);
                    let height = rng.gen_range(0.05..=0.1);
                    Occlusion {
                        x: rng.gen_range(0.0..=1.0 - width),
                        y: rng.gen_range(0.0..=1.0 - height),
                        width,
                        height,
                    }
                })
                .collect();
        }
        if rng.gen_bool(cfg.color_jitter_prob) {
            params.color_jitter = Some(ColorJitter {
                hue_degrees: rng.gen_range(-18..=18),
                saturation: rng.gen_range(0.8..=1.2),
                brightness: rng.gen_range(0.8..=1.2),
            });
        }
        params.equalize = rng.gen_bool(cfg.equalize_prob);
        params
    }
}

fn clip(b: BoxXyxy, w: f64, h: f64) -> BoxXyxy {
    [
        b[0].clamp(0.0, w),
        b[1].clamp(0.0, h),
        b[2].clamp(0.0, w),
        b[3].clamp(0.0, h),
    ]
}

fn rotate_point(x: f64, y: f64, cx: f64, cy: f64, degrees: f64) -> (f64, f64) {
    let (sin, cos) = degrees.to_radians().sin_cos();
    let (dx, dy) = (x - cx, y - cy);
    (cx + dx * cos - dy * sin, cy + dx * sin + dy * cos)
}

fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

fn adjust_brightness_contrast(img: &mut RgbImage, brightness: f32, contrast: f32) {
    for pixel in img.pixels_mut() {
        for c in 0..3 {
            let v = pixel[c] as f32 / 255.0;
            let v = ((v - 0.5) * contrast + 0.5) * brightness;
            pixel[c] = to_u8(v * 255.0);
        }
    }
}

/// Same-size rotation, nearest neighbour; uncovered corners are black.
fn rotate_about_center(img: &RgbImage, degrees: f64) -> RgbImage {
    let (w, h) = img.dimensions();
    let (cx, cy) = (w as f64 / 2.0, h as f64 / 2.0);
    RgbImage::from_fn(w, h, |x, y| {
        let (sx, sy) = rotate_point(x as f64 + 0.5, y as f64 + 0.5, cx, cy, -degrees);
        let (sx, sy) = (sx.floor(), sy.floor());
        if sx >= 0.0 && sy >= 0.0 && sx < w as f64 && sy < h as f64 {
            *img.get_pixel(sx as u32, sy as u32)
        } else {
            Rgb([0, 0, 0])
        }
    })
}

fn add_noise(img: &mut RgbImage, noise: NoiseParams) {
    let mut rng = StdRng::seed_from_u64(noise.seed);
    let strength = noise.strength * 255.0;
    for pixel in img.pixels_mut() {
        for c in 0..3 {
            let delta: f32 = rng.gen_range(-strength..=strength);
            pixel[c] = to_u8(pixel[c] as f32 + delta);
        }
    }
}

fn occlude(img: &mut RgbImage, occlusion: &Occlusion) {
    let (w, h) = img.dimensions();
    let x0 = (occlusion.x * w as f32) as u32;
    let y0 = (occlusion.y * h as f32) as u32;
    let x1 = (((occlusion.x + occlusion.width) * w as f32) as u32).min(w);
    let y1 = (((occlusion.y + occlusion.height) * h as f32) as u32).min(h);
    for y in y0..y1 {
        for x in x0..x1 {
            img.put_pixel(x, y, Rgb([0, 0, 0]));
        }
    }
}

fn jitter_color(img: &RgbImage, jitter: ColorJitter) -> RgbImage {
    let mut out = imageops::huerotate(img, jitter.hue_degrees);
    for pixel in out.pixels_mut() {
        let [r, g, b] = pixel.0.map(|v| v as f32);
        let luma = 0.299 * r + 0.587 * g + 0.114 * b;
        for (c, v) in [r, g, b].into_iter().enumerate() {
            pixel[c] = to_u8((luma + (v - luma) * jitter.saturation) * jitter.brightness);
        }
    }
    out
}

/// Per-channel histogram equalization.
fn equalize(img: &mut RgbImage) {
    let total = (img.width() as u64 * img.height() as u64) as f64;
    if total == 0.0 {
        return;
    }
    for c in 0..3 {
        let mut hist = [0u64; 256];
        for pixel in img.pixels() {
            hist[pixel[c] as usize] += 1;
        }
        let mut cdf = [0u64; 256];
        let mut running = 0;
        for (i, count) in hist.iter().enumerate() {
            running += count;
            cdf[i] = running;
        }
        let cdf_min = cdf.iter().copied().find(|&v| v > 0).unwrap_or(0) as f64;
        if total - cdf_min <= 0.0 {
            continue;
        }
        let lut: Vec<u8> = cdf
            .iter()
            .map(|&v| to_u8(((v as f64 - cdf_min) / (total - cdf_min) * 255.0) as f32))
            .collect();
        for pixel in img.pixels_mut() {
            pixel[c] = lut[pixel[c] as usize];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_keeps_box_and_pixels() {
        let params = AugmentParams::default();
        assert_eq!(
            params.map_box([10.0, 20.0, 30.0, 40.0], 100, 80),
            Some([10.0, 20.0, 30.0, 40.0])
        );

        let img = RgbImage::from_fn(4, 3, |x, y| Rgb([x as u8 * 10, y as u8 * 10, 7]));
        assert_eq!(params.apply(img.clone()), img);
    }

    #[test]
    fn flip_mirrors_box_horizontally() {
        let params = AugmentParams {
            flip: true,
            ..AugmentParams::default()
        };
        assert_eq!(
            params.map_box([10.0, 5.0, 30.0, 15.0], 100, 50),
            Some([70.0, 5.0, 90.0, 15.0])
        );
    }

    #[test]
    fn crop_outside_the_box_is_degenerate() {
        let params = AugmentParams {
            crop: Some(CropWindow {
                x: 500,
                y: 0,
                width: 800,
                height: 800,
            }),
            ..AugmentParams::default()
        };
        assert_eq!(params.map_box([10.0, 10.0, 200.0, 200.0], 1920, 1080), None);

        let kept = params.map_box([400.0, 100.0, 700.0, 300.0], 1920, 1080).unwrap();
        assert_eq!(kept, [0.0, 100.0, 200.0, 300.0]);
        assert_eq!(params.output_size(1920, 1080), (800, 800));
    }

    #[test]
    fn rotation_grows_box_around_rotated_corners() {
        let params = AugmentParams {
            rotation_degrees: Some(90.0),
            ..AugmentParams::default()
        };
        let mapped = params.map_box([40.0, 45.0, 60.0, 55.0], 100, 100).unwrap();
        // A 20x10 box at the center becomes 10x20.
        assert!((mapped[2] - mapped[0] - 10.0).abs() < 1e-9);
        assert!((mapped[3] - mapped[1] - 20.0).abs() < 1e-9);
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let mut a = RandomAugmenter::new(AugmentConfig::default(), Some(7));
        let mut b = RandomAugmenter::new(AugmentConfig::default(), Some(7));
        for _ in 0..20 {
            assert_eq!(a.sample(1920, 1080), b.sample(1920, 1080));
        }
    }

    #[test]
    fn small_images_are_never_cropped() {
        let config = AugmentConfig {
            crop_prob: 1.0,
            ..AugmentConfig::default()
        };
        let mut augmenter = RandomAugmenter::new(config, Some(1));
        for _ in 0..10 {
            assert!(augmenter.sample(640, 480).crop.is_none());
        }
    }

    #[test]
    fn apply_matches_output_size() {
        let config = AugmentConfig {
            crop_prob: 1.0,
            crop_size: (16, 8),
            flip_prob: 1.0,
            rotate_prob: 1.0,
            noise_prob: 1.0,
            blur_prob: 1.0,
            occlusion_prob: 1.0,
            color_jitter_prob: 1.0,
            equalize_prob: 1.0,
            brightness_contrast_prob: 1.0,
            ..AugmentConfig::default()
        };
        let mut augmenter = RandomAugmenter::new(config, Some(3));
        let params = augmenter.sample(32, 24);
        let out = params.apply(RgbImage::from_pixel(32, 24, Rgb([120, 80, 40])));
        assert_eq!(out.dimensions(), params.output_size(32, 24));
    }
}
