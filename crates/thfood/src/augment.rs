use std::sync::{Arc, Mutex, PoisonError};
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const VERTICAL_FLIP_PROB: f64 = 0.1;
const MAX_ROTATION_DEGREES: f32 = 30.0;
const BRIGHTNESS: f32 = 0.3;
const CROP_SCALE: (f64, f64) = (0.8, 1.0);
const CROP_RATIO: (f64, f64) = (3.0 / 4.0, 4.0 / 3.0);
const CROP_ATTEMPTS: usize = 10;

/// Random training transform. Clones share one seeded generator.
#[derive(Debug, Clone)]
pub struct Augmentation {
	size: u32,
	rng: Arc<Mutex<StdRng>>,
}

impl Augmentation {
	pub fn new(size: u32, seed: u64) -> Self {
		Self {
			size,
			rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
		}
	}

	pub fn apply(&self, image: &DynamicImage) -> RgbImage {
		let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
		transform(image, self.size, &mut *rng)
	}
}

/// Resize, flips, rotation, brightness jitter, then a random resized crop back to `size`.
pub fn transform<R: Rng>(image: &DynamicImage, size: u32, rng: &mut R) -> RgbImage {
	let mut image = image.resize_exact(size, size, FilterType::Triangle).into_rgb8();

	if rng.gen_bool(0.5) {
		imageops::flip_horizontal_in_place(&mut image);
	}
	if rng.gen_bool(VERTICAL_FLIP_PROB) {
		imageops::flip_vertical_in_place(&mut image);
	}

	let angle = rng.gen_range(-MAX_ROTATION_DEGREES..=MAX_ROTATION_DEGREES);
	let mut image = rotate(&image, angle);

	let factor = rng.gen_range(1.0 - BRIGHTNESS..=1.0 + BRIGHTNESS);
	adjust_brightness(&mut image, factor);

	random_resized_crop(&image, size, rng)
}

/// Rotation about the centre, nearest neighbour, uncovered corners black.
pub fn rotate(image: &RgbImage, degrees: f32) -> RgbImage {
	let (width, height) = image.dimensions();
	let (sin, cos) = degrees.to_radians().sin_cos();
	let cx = (width as f32 - 1.0) / 2.0;
	let cy = (height as f32 - 1.0) / 2.0;

	RgbImage::from_fn(width, height, |x, y| {
		let dx = x as f32 - cx;
		let dy = y as f32 - cy;
		let sx = (cos * dx + sin * dy + cx).round();
		let sy = (-sin * dx + cos * dy + cy).round();

		if sx >= 0.0 && sy >= 0.0 && (sx as u32) < width && (sy as u32) < height {
			*image.get_pixel(sx as u32, sy as u32)
		} else {
			Rgb([0, 0, 0])
		}
	})
}

pub fn adjust_brightness(image: &mut RgbImage, factor: f32) {
	for value in image.iter_mut() {
		*value = (*value as f32 * factor).round().clamp(0.0, 255.0) as u8;
	}
}

/// Crop covering 80 to 100% of the area at a 3:4 to 4:3 aspect, resized to `size`.
pub fn random_resized_crop<R: Rng>(image: &RgbImage, size: u32, rng: &mut R) -> RgbImage {
	let (x, y, width, height) = crop_window(image.width(), image.height(), rng);
	let crop = imageops::crop_imm(image, x, y, width, height).to_image();

	imageops::resize(&crop, size, size, FilterType::Triangle)
}

fn crop_window<R: Rng>(width: u32, height: u32, rng: &mut R) -> (u32, u32, u32, u32) {
	let area = (width * height) as f64;
	let log_ratio = (CROP_RATIO.0.ln(), CROP_RATIO.1.ln());

	for _ in 0..CROP_ATTEMPTS {
		let target_area = area * rng.gen_range(CROP_SCALE.0..=CROP_SCALE.1);
		let aspect = rng.gen_range(log_ratio.0..=log_ratio.1).exp();

		let w = (target_area * aspect).sqrt().round() as u32;
		let h = (target_area / aspect).sqrt().round() as u32;

		if w > 0 && h > 0 && w <= width && h <= height {
			let x = rng.gen_range(0..=width - w);
			let y = rng.gen_range(0..=height - h);
			return (x, y, w, h);
		}
	}

	// centre crop at the closest allowed aspect
	let ratio = width as f64 / height as f64;
	let (w, h) = if ratio < CROP_RATIO.0 {
		(width, ((width as f64 / CROP_RATIO.0).round() as u32).min(height))
	} else if ratio > CROP_RATIO.1 {
		(((height as f64 * CROP_RATIO.1).round() as u32).min(width), height)
	} else {
		(width, height)
	};

	((width - w) / 2, (height - h) / 2, w, h)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn gradient(width: u32, height: u32) -> RgbImage {
		RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]))
	}

	#[test]
	fn output_is_square() {
		let mut rng = StdRng::seed_from_u64(7);
		let image = DynamicImage::ImageRgb8(gradient(320, 180));

		for _ in 0..5 {
			assert_eq!(transform(&image, 224, &mut rng).dimensions(), (224, 224));
		}
	}

	#[test]
	fn same_seed_same_output() {
		let image = DynamicImage::ImageRgb8(gradient(100, 80));

		let first = Augmentation::new(64, 42).apply(&image);
		let second = Augmentation::new(64, 42).apply(&image);

		assert_eq!(first, second);
	}

	#[test]
	fn zero_rotation_is_identity() {
		let image = gradient(31, 17);

		assert_eq!(rotate(&image, 0.0), image);
	}

	#[test]
	fn rotation_blackens_corners() {
		let image = RgbImage::from_pixel(50, 50, Rgb([255, 255, 255]));

		let rotated = rotate(&image, 30.0);

		assert_eq!(*rotated.get_pixel(0, 0), Rgb([0, 0, 0]));
		assert_eq!(*rotated.get_pixel(25, 25), Rgb([255, 255, 255]));
	}

	#[test]
	fn brightness_saturates() {
		let mut image = RgbImage::from_pixel(2, 2, Rgb([200, 100, 0]));

		adjust_brightness(&mut image, 1.3);

		assert_eq!(*image.get_pixel(0, 0), Rgb([255, 130, 0]));
	}

	#[test]
	fn crop_window_stays_inside() {
		let mut rng = StdRng::seed_from_u64(3);

		for (width, height) in [(224, 224), (400, 100), (10, 300)] {
			let (x, y, w, h) = crop_window(width, height, &mut rng);
			assert!(w > 0 && h > 0);
			assert!(x + w <= width && y + h <= height);
		}
	}
}
