// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Square preview images derived from uploaded originals.
//!
//! The generator tries its sources in order, the short-lived retrieval URL
//! first and the durable public URL second, and stops at the first one that
//! yields a thumbnail. Each attempt fetches the bytes, decodes them, scales
//! them to cover the target square, center-crops and re-encodes. WebP is
//! preferred and JPEG is the fallback encoding.
//!
//! Decoding and encoding go through the [`ImageCodec`] trait so callers can
//! plug in their own formats.

use crate::{
    Error, ObjectStore,
    storage::{ImageTransform, ResizeMode, RetrievalOptions},
    url_cache::SecureUrlCache,
};
use image::{
    DynamicImage, ExtendedColorType, ImageEncoder as _, RgbaImage,
    codecs::{jpeg::JpegEncoder, webp::WebPEncoder},
    imageops::{self, FilterType},
};
use log::{debug, warn};
use std::sync::Arc;

/// Decoded image as tightly packed RGBA8 pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Raster {
    fn into_image(self) -> Result<RgbaImage, Error> {
        let (width, height) = (self.width, self.height);
        RgbaImage::from_raw(width, height, self.pixels).ok_or_else(|| {
            Error::InvalidParameters(format!("Pixel buffer does not match {}x{}", width, height))
        })
    }

    fn from_image(image: RgbaImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            pixels: image.into_raw(),
        }
    }
}

/// Encoded thumbnail format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailFormat {
    WebP,
    Jpeg,
}

impl ThumbnailFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ThumbnailFormat::WebP => "image/webp",
            ThumbnailFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ThumbnailFormat::WebP => "webp",
            ThumbnailFormat::Jpeg => "jpg",
        }
    }
}

/// Raster decode/encode capability.
pub trait ImageCodec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Raster, Error>;
    fn encode(&self, raster: &Raster, format: ThumbnailFormat) -> Result<Vec<u8>, Error>;
}

/// [`ImageCodec`] backed by the `image` crate.
#[derive(Debug, Clone, Copy)]
pub struct ImageCrateCodec {
    pub jpeg_quality: u8,
}

impl Default for ImageCrateCodec {
    fn default() -> Self {
        Self { jpeg_quality: 85 }
    }
}

impl ImageCodec for ImageCrateCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Raster, Error> {
        let image = image::load_from_memory(bytes)?;
        Ok(Raster::from_image(image.to_rgba8()))
    }

    fn encode(&self, raster: &Raster, format: ThumbnailFormat) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        match format {
            ThumbnailFormat::WebP => {
                WebPEncoder::new_lossless(&mut out).write_image(
                    &raster.pixels,
                    raster.width,
                    raster.height,
                    ExtendedColorType::Rgba8,
                )?;
            }
            ThumbnailFormat::Jpeg => {
                let rgb = DynamicImage::ImageRgba8(raster.clone().into_image()?).to_rgb8();
                JpegEncoder::new_with_quality(&mut out, self.jpeg_quality).write_image(
                    rgb.as_raw(),
                    rgb.width(),
                    rgb.height(),
                    ExtendedColorType::Rgb8,
                )?;
            }
        }
        Ok(out)
    }
}

/// Encoded thumbnail ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub extension: &'static str,
}

/// Scale `raster` so it covers a `target` square, then crop the center.
pub fn cover_crop(raster: Raster, target: u32) -> Result<Raster, Error> {
    if raster.width == 0 || raster.height == 0 || target == 0 {
        return Err(Error::InvalidParameters(format!(
            "Cannot scale {}x{} to {}",
            raster.width, raster.height, target
        )));
    }

    let t = target as f64;
    let scale = (t / raster.width as f64).max(t / raster.height as f64);
    let scaled_w = ((raster.width as f64 * scale).round() as u32).max(target);
    let scaled_h = ((raster.height as f64 * scale).round() as u32).max(target);

    let image = raster.into_image()?;
    let scaled = imageops::resize(&image, scaled_w, scaled_h, FilterType::Triangle);
    let x = (scaled_w - target) / 2;
    let y = (scaled_h - target) / 2;
    let cropped = imageops::crop_imm(&scaled, x, y, target, target).to_image();
    Ok(Raster::from_image(cropped))
}

fn render(codec: &dyn ImageCodec, bytes: &[u8], target: u32) -> Result<Thumbnail, Error> {
    let raster = cover_crop(codec.decode(bytes)?, target)?;

    let mut last_err = None;
    for format in [ThumbnailFormat::WebP, ThumbnailFormat::Jpeg] {
        match codec.encode(&raster, format) {
            Ok(bytes) => {
                return Ok(Thumbnail {
                    bytes,
                    content_type: format.content_type(),
                    extension: format.extension(),
                });
            }
            Err(err) => {
                debug!("{:?} encoding unavailable: {}", format, err);
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::UnsupportedFormat("No thumbnail encoding".into())))
}

/// Derives thumbnails for uploaded originals.
#[derive(Clone)]
pub struct ThumbnailGenerator {
    store: Arc<dyn ObjectStore>,
    cache: SecureUrlCache,
    codec: Arc<dyn ImageCodec>,
    size: u32,
    ttl_seconds: u64,
}

impl ThumbnailGenerator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        cache: SecureUrlCache,
        codec: Arc<dyn ImageCodec>,
        size: u32,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            store,
            cache,
            codec,
            size,
            ttl_seconds,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    async fn attempt(&self, url: &str) -> Result<Thumbnail, Error> {
        let bytes = self.store.fetch(url).await?;
        let codec = self.codec.clone();
        let size = self.size;
        tokio::task::spawn_blocking(move || render(codec.as_ref(), &bytes, size)).await?
    }

    /// Produce a thumbnail for the object at `bucket/original_path`, or
    /// `None` when every source fails. Never returns an error.
    pub async fn generate(
        &self,
        bucket: &str,
        original_path: &str,
        public_url: &str,
    ) -> Option<Thumbnail> {
        let options = RetrievalOptions::new(self.ttl_seconds).with_transform(ImageTransform {
            width: Some(self.size),
            height: Some(self.size),
            resize: Some(ResizeMode::Cover),
            quality: None,
        });

        match self.cache.get_url(bucket, original_path, &options).await {
            Ok(url) => match self.attempt(&url).await {
                Ok(thumbnail) => return Some(thumbnail),
                Err(err) => debug!("Signed source for {} failed: {}", original_path, err),
            },
            Err(err) => debug!("No signed URL for {}: {}", original_path, err),
        }

        match self.attempt(public_url).await {
            Ok(thumbnail) => Some(thumbnail),
            Err(err) => {
                warn!("Thumbnail generation failed for {}: {}", original_path, err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryObjectStore, StoredObject};
    use async_trait::async_trait;
    use image::{ImageFormat, Rgba};
    use std::{
        io::Cursor,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbaImage::from_fn(width, height, |x, _| {
            if x < width / 2 {
                Rgba([255, 0, 0, 255])
            } else {
                Rgba([0, 0, 255, 255])
            }
        });
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    /// Codec whose WebP encoder is missing.
    struct JpegOnly;

    impl ImageCodec for JpegOnly {
        fn decode(&self, bytes: &[u8]) -> Result<Raster, Error> {
            ImageCrateCodec::default().decode(bytes)
        }

        fn encode(&self, raster: &Raster, format: ThumbnailFormat) -> Result<Vec<u8>, Error> {
            match format {
                ThumbnailFormat::WebP => Err(Error::UnsupportedFormat("webp".into())),
                ThumbnailFormat::Jpeg => ImageCrateCodec::default().encode(raster, format),
            }
        }
    }

    /// Store that cannot issue retrieval URLs.
    #[derive(Default)]
    struct NoSigning {
        inner: MemoryObjectStore,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for NoSigning {
        async fn upload(
            &self,
            bucket: &str,
            path: &str,
            bytes: &[u8],
            content_type: &str,
        ) -> Result<StoredObject, Error> {
            self.inner.upload(bucket, path, bytes, content_type).await
        }

        async fn issue_retrieval_url(
            &self,
            _bucket: &str,
            _path: &str,
            _options: &RetrievalOptions,
        ) -> Result<String, Error> {
            Err(Error::UrlIssue("signing disabled".into()))
        }

        async fn fetch(&self, url: &str) -> Result<Vec<u8>, Error> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch(url).await
        }
    }

    fn generator(store: Arc<dyn ObjectStore>, codec: Arc<dyn ImageCodec>) -> ThumbnailGenerator {
        let cache = SecureUrlCache::new(store.clone(), 16, Duration::from_secs(30), 2);
        ThumbnailGenerator::new(store, cache, codec, 32, 3600)
    }

    #[test]
    fn test_cover_crop_is_square_and_centered() {
        let raster = ImageCrateCodec::default().decode(&png(200, 100)).unwrap();
        let thumb = cover_crop(raster, 50).unwrap();
        assert_eq!((thumb.width, thumb.height), (50, 50));
        assert_eq!(thumb.pixels.len(), 50 * 50 * 4);

        // Left edge is red and right edge is blue after the center crop.
        assert_eq!(&thumb.pixels[0..4], &[255, 0, 0, 255]);
        let last = thumb.pixels.len() - 4;
        assert_eq!(&thumb.pixels[last..], &[0, 0, 255, 255]);
    }

    #[test]
    fn test_cover_crop_upscales_small_images() {
        let raster = ImageCrateCodec::default().decode(&png(4, 8)).unwrap();
        let thumb = cover_crop(raster, 16).unwrap();
        assert_eq!((thumb.width, thumb.height), (16, 16));
    }

    #[test]
    fn test_render_prefers_webp() {
        let thumb = render(&ImageCrateCodec::default(), &png(64, 48), 32).unwrap();
        assert_eq!(thumb.content_type, "image/webp");
        assert_eq!(thumb.extension, "webp");
        assert_eq!(infer::get(&thumb.bytes).map(|t| t.extension()), Some("webp"));
    }

    #[test]
    fn test_render_falls_back_to_jpeg() {
        let thumb = render(&JpegOnly, &png(64, 48), 32).unwrap();
        assert_eq!(thumb.content_type, "image/jpeg");
        assert_eq!(thumb.extension, "jpg");
        let decoded = image::load_from_memory(&thumb.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 32));
    }

    #[tokio::test]
    async fn test_generate_via_signed_url() {
        let store = Arc::new(MemoryObjectStore::new());
        let stored = store
            .upload("datasets", "p/s/images/Training/a.png", &png(40, 40), "image/png")
            .await
            .unwrap();
        let generator = generator(store.clone(), Arc::new(ImageCrateCodec::default()));

        let thumb = generator
            .generate("datasets", &stored.path, &stored.public_url)
            .await
            .unwrap();
        assert_eq!(thumb.extension, "webp");
        assert_eq!(store.issue_count(), 1);
        assert_eq!(store.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_generate_falls_back_to_public_url() {
        let store = Arc::new(NoSigning::default());
        let stored = store
            .upload("datasets", "a.png", &png(40, 40), "image/png")
            .await
            .unwrap();
        let generator = generator(store.clone(), Arc::new(ImageCrateCodec::default()));

        let thumb = generator
            .generate("datasets", &stored.path, &stored.public_url)
            .await;
        assert!(thumb.is_some());
        assert_eq!(store.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_generate_returns_none_for_undecodable_bytes() {
        let store = Arc::new(MemoryObjectStore::new());
        let stored = store
            .upload("datasets", "a.png", b"not an image", "image/png")
            .await
            .unwrap();
        let generator = generator(store.clone(), Arc::new(ImageCrateCodec::default()));

        let thumb = generator
            .generate("datasets", &stored.path, &stored.public_url)
            .await;
        assert!(thumb.is_none());
        // Both sources were attempted.
        assert_eq!(store.fetch_count(), 2);
    }
}
