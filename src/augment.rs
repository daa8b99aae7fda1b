//! Image to tensor transforms.
//!
//! Both transforms produce a `[3, size, size]` array in CHW order, normalized
//! per channel with the same mean/std, so a model trained on the randomized
//! variant can be served with the deterministic one.

use burn::config::Config;
use image::{
    imageops::{self, FilterType},
    RgbImage,
};
use ndarray::{Array2, Array3, Axis, Zip};
use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{self, PipelineError};

const CROP_ATTEMPTS: usize = 10;

#[derive(Config, Debug)]
pub struct AugmentationConfig {
    #[config(default = 224)]
    pub image_size: usize,

    /// Range of the crop area as a fraction of the source area.
    #[config(default = "[0.8, 1.0]")]
    pub crop_scale: [f64; 2],

    /// Range of the crop aspect ratio (width / height).
    #[config(default = "[0.75, 1.3333333333333333]")]
    pub crop_ratio: [f64; 2],

    #[config(default = 0.5)]
    pub flip_probability: f64,

    /// Degrees.
    #[config(default = 15.0)]
    pub max_rotation: f64,

    /// Fraction of the image size, per axis.
    #[config(default = 0.1)]
    pub max_translation: f64,

    #[config(default = 0.3)]
    pub brightness: f64,

    #[config(default = 0.3)]
    pub contrast: f64,

    #[config(default = 0.3)]
    pub saturation: f64,

    #[config(default = 0.1)]
    pub hue: f64,

    #[config(default = "[0.485, 0.456, 0.406]")]
    pub mean: [f32; 3],

    #[config(default = "[0.229, 0.224, 0.225]")]
    pub std: [f32; 3],

    /// Seeds the training transform. Unset means OS entropy.
    #[config(default = "None")]
    pub seed: Option<u64>,
}

impl AugmentationConfig {
    /// Rejects values the training transform cannot sample from.
    pub fn validate(&self) -> error::Result<()> {
        let ordered = |[low, high]: [f64; 2]| low.is_finite() && high.is_finite() && low <= high;
        let non_negative = |value: f64| value.is_finite() && value >= 0.0;

        let problem = if self.image_size == 0 {
            Some("image_size must be at least 1")
        } else if !(ordered(self.crop_scale) && self.crop_scale[0] > 0.0) {
            Some("crop_scale must be an increasing range of positive values")
        } else if !(ordered(self.crop_ratio) && self.crop_ratio[0] > 0.0) {
            Some("crop_ratio must be an increasing range of positive values")
        } else if !(0.0..=1.0).contains(&self.flip_probability) {
            Some("flip_probability must lie in [0, 1]")
        } else if !non_negative(self.max_rotation) {
            Some("max_rotation must be non-negative")
        } else if !(non_negative(self.max_translation) && self.max_translation <= 1.0) {
            Some("max_translation must lie in [0, 1]")
        } else if ![self.brightness, self.contrast, self.saturation]
            .into_iter()
            .all(non_negative)
        {
            Some("brightness, contrast and saturation must be non-negative")
        } else if !(non_negative(self.hue) && self.hue <= 0.5) {
            Some("hue must lie in [0, 0.5]")
        } else if !self.std.iter().all(|std| std.is_finite() && *std > 0.0) {
            Some("std must be positive")
        } else {
            None
        };

        match problem {
            Some(message) => Err(PipelineError::Config(format!("augmentation: {message}"))),
            None => Ok(()),
        }
    }
}

pub struct AugmentationPipeline {
    config: AugmentationConfig,
    rng: Option<ChaCha8Rng>,
}

impl AugmentationPipeline {
    pub fn train(config: AugmentationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };

        Self {
            config,
            rng: Some(rng),
        }
    }

    pub fn eval(config: AugmentationConfig) -> Self {
        Self { config, rng: None }
    }

    /// Train: crop, flip, rotate, jitter colors, translate. Eval: resize.
    pub fn apply(&mut self, image: &RgbImage) -> Array3<f32> {
        let size = self.config.image_size as u32;
        let config = &self.config;

        let pixels = match self.rng.as_mut() {
            None => to_chw(&imageops::resize(image, size, size, FilterType::Triangle)),
            Some(rng) => {
                let image = random_resized_crop(image, size, config, rng);
                let image = if rng.gen_bool(config.flip_probability) {
                    imageops::flip_horizontal(&image)
                } else {
                    image
                };

                let angle = rng
                    .gen_range(-config.max_rotation..=config.max_rotation)
                    .to_radians();
                let mut pixels = warp_affine(&to_chw(&image), angle, (0.0, 0.0));
                color_jitter(&mut pixels, config, rng);

                let max_shift = config.max_translation * f64::from(size);
                let shift = (
                    rng.gen_range(-max_shift..=max_shift).round(),
                    rng.gen_range(-max_shift..=max_shift).round(),
                );
                warp_affine(&pixels, 0.0, shift)
            }
        };

        normalize(pixels, &config.mean, &config.std)
    }
}

fn random_resized_crop(
    image: &RgbImage,
    size: u32,
    config: &AugmentationConfig,
    rng: &mut ChaCha8Rng,
) -> RgbImage {
    let (width, height) = image.dimensions();
    let area = f64::from(width) * f64::from(height);
    let log_ratio = (config.crop_ratio[0].ln(), config.crop_ratio[1].ln());

    for _ in 0..CROP_ATTEMPTS {
        let target_area = area * rng.gen_range(config.crop_scale[0]..=config.crop_scale[1]);
        let ratio = rng.gen_range(log_ratio.0..=log_ratio.1).exp();

        let crop_width = (target_area * ratio).sqrt().round() as u32;
        let crop_height = (target_area / ratio).sqrt().round() as u32;

        if crop_width > 0 && crop_height > 0 && crop_width <= width && crop_height <= height {
            let x = rng.gen_range(0..=width - crop_width);
            let y = rng.gen_range(0..=height - crop_height);
            let crop = imageops::crop_imm(image, x, y, crop_width, crop_height).to_image();

            return imageops::resize(&crop, size, size, FilterType::Triangle);
        }
    }

    let (crop_width, crop_height) = fallback_crop(width, height, config.crop_ratio);
    let crop = imageops::crop_imm(
        image,
        (width - crop_width) / 2,
        (height - crop_height) / 2,
        crop_width,
        crop_height,
    )
    .to_image();

    imageops::resize(&crop, size, size, FilterType::Triangle)
}

/// Largest centered crop whose aspect ratio is clamped into `ratio`.
fn fallback_crop(width: u32, height: u32, [min_ratio, max_ratio]: [f64; 2]) -> (u32, u32) {
    let ratio = f64::from(width) / f64::from(height);

    if ratio < min_ratio {
        let crop_height = (f64::from(width) / min_ratio).round() as u32;
        (width, crop_height.clamp(1, height))
    } else if ratio > max_ratio {
        let crop_width = (f64::from(height) * max_ratio).round() as u32;
        (crop_width.clamp(1, width), height)
    } else {
        (width, height)
    }
}

/// Rotates about the center by `angle` radians, then shifts by `shift` pixels.
/// Pixels that map outside the source are zero.
fn warp_affine(pixels: &Array3<f32>, angle: f64, shift: (f64, f64)) -> Array3<f32> {
    let (channels, height, width) = pixels.dim();
    let center = ((width as f64 - 1.0) / 2.0, (height as f64 - 1.0) / 2.0);
    let (sin, cos) = angle.sin_cos();

    let mut out = Array3::zeros((channels, height, width));
    for y in 0..height {
        for x in 0..width {
            let dx = x as f64 - center.0 - shift.0;
            let dy = y as f64 - center.1 - shift.1;
            let source_x = cos * dx + sin * dy + center.0;
            let source_y = -sin * dx + cos * dy + center.1;

            if let Some(sample) = bilinear(pixels, source_x, source_y) {
                for (c, value) in sample.into_iter().enumerate() {
                    out[[c, y, x]] = value;
                }
            }
        }
    }

    out
}

fn bilinear(pixels: &Array3<f32>, x: f64, y: f64) -> Option<[f32; 3]> {
    let (_, height, width) = pixels.dim();
    if !(0.0..=(width - 1) as f64).contains(&x) || !(0.0..=(height - 1) as f64).contains(&y) {
        return None;
    }

    let (x0, y0) = (x.floor() as usize, y.floor() as usize);
    let (x1, y1) = ((x0 + 1).min(width - 1), (y0 + 1).min(height - 1));
    let (fx, fy) = ((x - x0 as f64) as f32, (y - y0 as f64) as f32);

    Some([0, 1, 2].map(|c| {
        let top = pixels[[c, y0, x0]] * (1.0 - fx) + pixels[[c, y0, x1]] * fx;
        let bottom = pixels[[c, y1, x0]] * (1.0 - fx) + pixels[[c, y1, x1]] * fx;
        top * (1.0 - fy) + bottom * fy
    }))
}

fn to_chw(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();

    Array3::from_shape_fn((3, height as usize, width as usize), |(c, y, x)| {
        f32::from(image.get_pixel(x as u32, y as u32)[c]) / 255.0
    })
}

fn normalize(mut pixels: Array3<f32>, mean: &[f32; 3], std: &[f32; 3]) -> Array3<f32> {
    for (c, mut channel) in pixels.axis_iter_mut(Axis(0)).enumerate() {
        channel.mapv_inplace(|v| (v - mean[c]) / std[c]);
    }

    pixels
}

#[derive(Debug, Clone, Copy)]
enum Jitter {
    Brightness,
    Contrast,
    Saturation,
    Hue,
}

/// Brightness, contrast, saturation and hue, each sampled independently and
/// applied in a random order. Operates on values in [0, 1].
fn color_jitter(pixels: &mut Array3<f32>, config: &AugmentationConfig, rng: &mut ChaCha8Rng) {
    let mut order = [
        Jitter::Brightness,
        Jitter::Contrast,
        Jitter::Saturation,
        Jitter::Hue,
    ];
    order.shuffle(rng);

    for jitter in order {
        match jitter {
            Jitter::Brightness if config.brightness > 0.0 => {
                let factor = jitter_factor(rng, config.brightness);
                pixels.mapv_inplace(|v| (v * factor).clamp(0.0, 1.0));
            }
            Jitter::Contrast if config.contrast > 0.0 => {
                let factor = jitter_factor(rng, config.contrast);
                let mean = grayscale(pixels).mean().unwrap_or(0.0);
                pixels.mapv_inplace(|v| (mean + (v - mean) * factor).clamp(0.0, 1.0));
            }
            Jitter::Saturation if config.saturation > 0.0 => {
                let factor = jitter_factor(rng, config.saturation);
                let gray = grayscale(pixels);
                for mut channel in pixels.axis_iter_mut(Axis(0)) {
                    Zip::from(&mut channel).and(&gray).for_each(|v, &g| {
                        *v = (g + (*v - g) * factor).clamp(0.0, 1.0);
                    });
                }
            }
            Jitter::Hue if config.hue > 0.0 => {
                let shift = rng.gen_range(-config.hue..=config.hue) as f32;
                shift_hue(pixels, shift);
            }
            _ => {}
        }
    }
}

fn jitter_factor(rng: &mut ChaCha8Rng, amount: f64) -> f32 {
    rng.gen_range((1.0 - amount).max(0.0)..=1.0 + amount) as f32
}

fn grayscale(pixels: &Array3<f32>) -> Array2<f32> {
    let r = pixels.index_axis(Axis(0), 0);
    let g = pixels.index_axis(Axis(0), 1);
    let b = pixels.index_axis(Axis(0), 2);

    &r * 0.299_f32 + &g * 0.587_f32 + &b * 0.114_f32
}

fn shift_hue(pixels: &mut Array3<f32>, shift: f32) {
    let (_, height, width) = pixels.dim();

    for y in 0..height {
        for x in 0..width {
            let (h, s, v) = rgb_to_hsv([pixels[[0, y, x]], pixels[[1, y, x]], pixels[[2, y, x]]]);
            let rgb = hsv_to_rgb((h + shift).rem_euclid(1.0), s, v);
            for (c, value) in rgb.into_iter().enumerate() {
                pixels[[c, y, x]] = value;
            }
        }
    }
}

/// Hue in [0, 1).
fn rgb_to_hsv([r, g, b]: [f32; 3]) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta <= f32::EPSILON {
        0.0
    } else if max == r {
        ((g - b) / delta).rem_euclid(6.0) / 6.0
    } else if max == g {
        ((b - r) / delta + 2.0) / 6.0
    } else {
        ((r - g) / delta + 4.0) / 6.0
    };
    let saturation = if max <= f32::EPSILON { 0.0 } else { delta / max };

    (hue, saturation, max)
}

fn hsv_to_rgb(hue: f32, saturation: f32, value: f32) -> [f32; 3] {
    let sector = hue * 6.0;
    let chroma = value * saturation;
    let x = chroma * (1.0 - (sector.rem_euclid(2.0) - 1.0).abs());
    let m = value - chroma;

    let (r, g, b) = match sector as u32 {
        0 => (chroma, x, 0.0),
        1 => (x, chroma, 0.0),
        2 => (0.0, chroma, x),
        3 => (0.0, x, chroma),
        4 => (x, 0.0, chroma),
        _ => (chroma, 0.0, x),
    };

    [r + m, g + m, b + m]
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn both_transforms_share_shape() {
        let config = AugmentationConfig::new().with_image_size(32).with_seed(Some(1));
        let image = gradient(61, 45);

        let train = AugmentationPipeline::train(config.clone()).apply(&image);
        let eval = AugmentationPipeline::eval(config).apply(&image);

        assert_eq!(train.dim(), (3, 32, 32));
        assert_eq!(eval.dim(), (3, 32, 32));
    }

    #[test]
    fn eval_is_deterministic_and_normalized() {
        let config = AugmentationConfig::new().with_image_size(8);
        let mut pipeline = AugmentationPipeline::eval(config.clone());

        let white = RgbImage::from_pixel(20, 20, Rgb([255, 255, 255]));
        let first = pipeline.apply(&white);
        let second = pipeline.apply(&white);
        assert_eq!(first, second);

        for c in 0..3 {
            let expected = (1.0 - config.mean[c]) / config.std[c];
            assert!((first[[c, 3, 4]] - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn seeded_training_transform_is_reproducible() {
        let config = AugmentationConfig::new().with_image_size(16).with_seed(Some(42));
        let image = gradient(40, 30);

        let mut a = AugmentationPipeline::train(config.clone());
        let mut b = AugmentationPipeline::train(config);

        for _ in 0..3 {
            assert_eq!(a.apply(&image), b.apply(&image));
        }
    }

    #[test]
    fn training_transform_varies_between_calls() {
        let config = AugmentationConfig::new().with_image_size(16).with_seed(Some(3));
        let image = gradient(40, 30);
        let mut pipeline = AugmentationPipeline::train(config);

        let outputs: Vec<_> = (0..4).map(|_| pipeline.apply(&image)).collect();

        assert!(outputs.windows(2).any(|pair| pair[0] != pair[1]));
    }

    #[test]
    fn identity_warp_keeps_pixels() {
        let pixels = to_chw(&gradient(9, 7));
        assert_eq!(warp_affine(&pixels, 0.0, (0.0, 0.0)), pixels);
    }

    #[test]
    fn translation_fills_with_zero() {
        let pixels = to_chw(&RgbImage::from_pixel(10, 10, Rgb([200, 100, 50])));
        let shifted = warp_affine(&pixels, 0.0, (3.0, 0.0));

        assert_eq!(shifted[[0, 5, 0]], 0.0);
        assert_eq!(shifted[[0, 5, 9]], pixels[[0, 5, 9]]);
    }

    #[test]
    fn translated_border_stays_black_under_strong_jitter() {
        let config = AugmentationConfig::new()
            .with_image_size(16)
            .with_crop_scale([1.0, 1.0])
            .with_crop_ratio([1.0, 1.0])
            .with_flip_probability(0.0)
            .with_max_rotation(0.0)
            .with_max_translation(0.5)
            .with_brightness(0.0)
            .with_contrast(0.9)
            .with_saturation(0.0)
            .with_hue(0.0)
            .with_seed(Some(5));
        let black = -config.mean[0] / config.std[0];
        let mut pipeline = AugmentationPipeline::train(config);
        let image = RgbImage::from_pixel(16, 16, Rgb([180, 180, 180]));

        let shifted = (0..8)
            .map(|_| pipeline.apply(&image))
            .find(|pixels| pixels[[0, 0, 0]] != pixels[[0, 8, 8]])
            .expect("some draw translates the image");

        let border = shifted
            .index_axis(Axis(0), 0)
            .iter()
            .filter(|v| (**v - black).abs() < 1e-5)
            .count();
        assert!(border > 0);
    }

    #[test]
    fn fallback_crop_clamps_the_aspect_ratio() {
        assert_eq!(fallback_crop(400, 100, [0.75, 4.0 / 3.0]), (133, 100));
        assert_eq!(fallback_crop(100, 400, [0.75, 4.0 / 3.0]), (100, 133));
        assert_eq!(fallback_crop(120, 100, [0.75, 4.0 / 3.0]), (120, 100));
    }

    #[test]
    fn validation_rejects_unsampleable_ranges() {
        assert!(AugmentationConfig::new().validate().is_ok());

        let invalid = [
            AugmentationConfig::new().with_max_rotation(-15.0),
            AugmentationConfig::new().with_max_translation(-0.1),
            AugmentationConfig::new().with_crop_scale([1.0, 0.8]),
            AugmentationConfig::new().with_crop_ratio([1.3, 0.75]),
            AugmentationConfig::new().with_flip_probability(1.5),
            AugmentationConfig::new().with_contrast(-0.3),
            AugmentationConfig::new().with_hue(0.7),
            AugmentationConfig::new().with_std([0.2, 0.0, 0.2]),
            AugmentationConfig::new().with_image_size(0),
        ];
        for config in invalid {
            assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
        }
    }

    #[test]
    fn hsv_round_trip() {
        for rgb in [[0.2, 0.4, 0.6], [0.9, 0.1, 0.1], [0.5, 0.5, 0.5], [0.0, 1.0, 0.3]] {
            let (h, s, v) = rgb_to_hsv(rgb);
            let back = hsv_to_rgb(h, s, v);
            for (a, b) in rgb.iter().zip(back) {
                assert!((a - b).abs() < 1e-5, "{rgb:?} -> {back:?}");
            }
        }
    }

    #[test]
    fn jitter_keeps_unit_range() {
        let config = AugmentationConfig::new().with_brightness(0.9).with_contrast(0.9);
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let mut pixels = to_chw(&gradient(12, 12));

        color_jitter(&mut pixels, &config, &mut rng);

        assert!(pixels.iter().all(|v| (0.0..=1.0).contains(v)));
    }
}
