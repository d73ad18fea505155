use std::io::Cursor;

use anyhow::Context;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::{json, Map};
use sha2::{Digest, Sha256};

use crate::backend::{GeneratedImage, GenerationRequest, ImageData, ImageGenerator};

/// Offline generator: a solid PNG whose colour is derived from the prompt,
/// so different prompts yield visibly different images.
pub struct DryrunImageGenerator {
    width: u32,
    height: u32,
}

impl DryrunImageGenerator {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }
}

impl Default for DryrunImageGenerator {
    fn default() -> Self {
        Self::new(512, 512)
    }
}

impl ImageGenerator for DryrunImageGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &GenerationRequest) -> anyhow::Result<GeneratedImage> {
        let (r, g, b) = color_from_prompt(&request.prompt);
        let image = RgbImage::from_pixel(self.width, self.height, Rgb([r, g, b]));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .context("failed to encode dryrun image")?;

        let mut provider_metadata = Map::new();
        provider_metadata.insert("provider".to_string(), json!("dryrun"));
        provider_metadata.insert("model".to_string(), json!(request.model));
        provider_metadata.insert("width".to_string(), json!(self.width));
        provider_metadata.insert("height".to_string(), json!(self.height));
        provider_metadata.insert(
            "color".to_string(),
            json!(format!("#{r:02x}{g:02x}{b:02x}")),
        );
        Ok(GeneratedImage {
            image: ImageData::new(bytes, "image/png"),
            provider_metadata,
            warnings: Vec::new(),
        })
    }
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::backend::{GenerationRequest, ImageGenerator};

    use super::DryrunImageGenerator;

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            model: "dryrun-image-1".to_string(),
            prompt: prompt.to_string(),
            reference_images: Vec::new(),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn dryrun_writes_decodable_png_of_requested_size() -> anyhow::Result<()> {
        let generated = DryrunImageGenerator::new(32, 16).generate(&request("boat"))?;
        assert_eq!(generated.image.mime_type, "image/png");
        let decoded = image::load_from_memory(&generated.image.bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (32, 16));
        Ok(())
    }

    #[test]
    fn dryrun_colour_tracks_prompt() -> anyhow::Result<()> {
        let generator = DryrunImageGenerator::new(4, 4);
        let first = generator.generate(&request("boat"))?;
        let again = generator.generate(&request("boat"))?;
        let other = generator.generate(&request("boat, corrected"))?;
        assert_eq!(first.image, again.image);
        assert_ne!(
            first.provider_metadata.get("color"),
            other.provider_metadata.get("color")
        );
        Ok(())
    }
}
