//! Figure encoding: `DynamicImage` → base64 PNG wrapped in `ImageData`.
//!
//! Extracted figures are attached to the planning request so the model can
//! plan scenes around the paper's own diagrams. PNG keeps line art and axis
//! labels crisp; `detail: "high"` lets GPT-4-class models read them.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

/// Longest edge sent to the model; larger figures are downscaled.
const MAX_EDGE_PX: u32 = 1536;

/// Encode a figure as a base64 PNG ready for a multimodal request.
pub fn encode_figure(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    let img = if img.width().max(img.height()) > MAX_EDGE_PX {
        img.thumbnail(MAX_EDGE_PX, MAX_EDGE_PX)
    } else {
        img.clone()
    };

    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded figure → {} bytes base64", b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// Load a figure saved by the extractor and encode it.
pub fn load_figure(path: &Path) -> Result<ImageData, image::ImageError> {
    let img = image::open(path)?;
    encode_figure(&img)
}
