//! Turns an [`InputDocument`] into an ordered list of [`Page`] bitmaps,
//! gated by the effective page cap.

use image::DynamicImage;
use pageread_core::Page;
use pdfium_render::prelude::*;

use crate::error::{Error, Result};

/// The three input shapes `parse` accepts.
pub enum InputDocument {
    Image(DynamicImage),
    ImageBytes(Vec<u8>),
    PdfBytes(Vec<u8>),
}

/// Loads pdfium once per process and binds either the bundled platform
/// library or the system install.
pub struct PdfRuntime {
    pdfium: Pdfium,
}

impl PdfRuntime {
    pub fn new() -> Result<Self> {
        let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library())
            .map_err(|e| Error::PdfiumBind(e.to_string()))?;
        Ok(Self { pdfium: Pdfium::new(bindings) })
    }

    /// Loads `input`, rendering PDF pages to RGB bitmaps over a white
    /// background. `effective_max_pages` is `None` for no cap or
    /// `Some(n)` for the already-resolved `min(options, config)` cap;
    /// it is ignored for non-PDF inputs.
    pub fn load_pages(
        &self,
        input: InputDocument,
        dpi: u32,
        max_rendered_long_side: u32,
        effective_max_pages: Option<u32>,
    ) -> Result<Vec<Page>> {
        match input {
            InputDocument::Image(image) => Ok(vec![page_from_dynamic_image(&image)]),
            InputDocument::ImageBytes(bytes) => {
                let image = image::load_from_memory(&bytes).map_err(|e| Error::ImageDecode(e.to_string()))?;
                Ok(vec![page_from_dynamic_image(&image)])
            }
            InputDocument::PdfBytes(bytes) => self.load_pdf_pages(&bytes, dpi, max_rendered_long_side, effective_max_pages),
        }
    }

    fn load_pdf_pages(
        &self,
        bytes: &[u8],
        dpi: u32,
        max_rendered_long_side: u32,
        effective_max_pages: Option<u32>,
    ) -> Result<Vec<Page>> {
        let document = self
            .pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(|e| Error::PdfLoad(e.to_string()))?;
        let page_count = document.pages().len() as usize;
        let requested = match effective_max_pages {
            Some(cap) => (cap as usize).min(page_count),
            None => page_count,
        };
        if requested == 0 {
            return Err(Error::NoPages { requested, available: page_count });
        }

        let mut pages = Vec::with_capacity(requested);
        for (index, page) in document.pages().iter().take(requested).enumerate() {
            let rendered = render_pdf_page(&page, dpi, max_rendered_long_side)
                .map_err(|reason| Error::PageRender { page: index, reason })?;
            pages.push(rendered);
        }
        Ok(pages)
    }
}

/// Target scale = `min(dpi/72, cap/long_side_points)`, then render over
/// a white background.
fn render_pdf_page(page: &PdfPage, dpi: u32, max_rendered_long_side: u32) -> std::result::Result<Page, String> {
    let width_points = page.width().value;
    let height_points = page.height().value;
    let long_side_points = width_points.max(height_points);

    let dpi_scale = dpi as f32 / 72.0;
    let cap_scale = max_rendered_long_side as f32 / long_side_points;
    let scale = dpi_scale.min(cap_scale);

    let pixel_width = (width_points * scale).round().max(1.0) as i32;
    let pixel_height = (height_points * scale).round().max(1.0) as i32;

    let bitmap = page
        .render_with_config(
            &PdfRenderConfig::new()
                .set_target_width(pixel_width)
                .set_target_height(pixel_height)
                .render_form_data(true),
        )
        .map_err(|e| e.to_string())?;

    Ok(page_from_dynamic_image(&bitmap.as_image()))
}

fn page_from_dynamic_image(image: &DynamicImage) -> Page {
    let rgb = image.to_rgb8();
    let (width, height) = (rgb.width(), rgb.height());
    Page::new(width, height, rgb.into_raw())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn page_from_dynamic_image_preserves_dimensions() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(640, 480, Rgb([10, 20, 30])));
        let page = page_from_dynamic_image(&image);
        assert_eq!(page.width(), 640);
        assert_eq!(page.height(), 480);
        assert_eq!(page.rgb().len(), 640 * 480 * 3);
    }

    #[test]
    fn loading_single_image_yields_one_page() {
        let runtime = match PdfRuntime::new() {
            Ok(runtime) => runtime,
            Err(_) => return, // pdfium platform library not available in this environment
        };
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 10, Rgb([0, 0, 0])));
        let pages = runtime
            .load_pages(InputDocument::Image(image), 200, 3500, None)
            .unwrap();
        assert_eq!(pages.len(), 1);
    }
}
