//! Image handling: stitching uploaded images into a PDF and re-encoding
//! single images between raster formats. CPU-bound; run on a blocking thread.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use image::{ImageFormat, codecs::jpeg::JpegEncoder};
use lopdf::{
    Document, Object, Stream,
    content::{Content, Operation},
    dictionary,
};

use crate::session::ConversionError;

// Pixel dimensions map to page points assuming 96 DPI input imagery.
const POINTS_PER_PIXEL: f32 = 72.0 / 96.0;

/// Build a PDF at `output` with one page per input image, in input order.
/// Each page is sized to the image's pixel dimensions at 96 DPI and carries
/// the image as a JPEG-compressed XObject.
pub fn images_to_pdf(inputs: &[PathBuf], output: &Path, jpeg_quality: u8) -> Result<(), ConversionError> {
    let stage: &'static str = "pdf assembly";
    if inputs.is_empty() {
        return Err(ConversionError::upload("no images were provided"));
    }

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut kids: Vec<Object> = Vec::with_capacity(inputs.len());

    for input in inputs {
        let decoded = image::open(input).map_err(|err| {
            ConversionError::collaborator("image decoding", format!("{}: {err}", input.display()))
        })?;
        let rgb = decoded.to_rgb8();
        let (width, height) = rgb.dimensions();
        let page_width = width as f32 * POINTS_PER_PIXEL;
        let page_height = height as f32 * POINTS_PER_PIXEL;

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, jpeg_quality)
            .encode_image(&rgb)
            .map_err(|err| ConversionError::collaborator(stage, err.to_string()))?;

        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => width as i64,
                "Height" => height as i64,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "DCTDecode",
            },
            jpeg,
        ));

        let content = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new(
                    "cm",
                    vec![
                        Object::Real(page_width),
                        0.into(),
                        0.into(),
                        Object::Real(page_height),
                        0.into(),
                        0.into(),
                    ],
                ),
                Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
                Operation::new("Q", vec![]),
            ],
        };
        let encoded = content
            .encode()
            .map_err(|err| ConversionError::collaborator(stage, err.to_string()))?;
        let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));
        let resources_id = doc.add_object(dictionary! {
            "XObject" => dictionary! { "Im0" => image_id },
        });
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), Object::Real(page_width), Object::Real(page_height)],
            "Contents" => content_id,
            "Resources" => resources_id,
        });
        kids.push(page_id.into());
    }

    let page_count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => page_count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.save(output)
        .map_err(|err| ConversionError::collaborator(stage, err.to_string()))?;
    Ok(())
}

/// Re-encode `input` into the requested raster format at `output`. JPEG
/// output flattens alpha and encodes at the configured quality. An unknown
/// format name is a client error, not a collaborator failure.
pub fn reencode(
    input: &Path,
    target_format: &str,
    output: &Path,
    jpeg_quality: u8,
) -> Result<(), ConversionError> {
    let format = match target_format.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => ImageFormat::Jpeg,
        "png" => ImageFormat::Png,
        "webp" => ImageFormat::WebP,
        _ => return Err(ConversionError::unsupported_format(target_format)),
    };

    let decoded = image::open(input)
        .map_err(|err| ConversionError::collaborator("image decoding", err.to_string()))?;

    match format {
        ImageFormat::Jpeg => {
            let rgb = decoded.to_rgb8();
            let mut writer = BufWriter::new(File::create(output)?);
            JpegEncoder::new_with_quality(&mut writer, jpeg_quality)
                .encode_image(&rgb)
                .map_err(|err| ConversionError::collaborator("image encoding", err.to_string()))?;
            writer.flush()?;
        }
        _ => decoded
            .save_with_format(output, format)
            .map_err(|err| ConversionError::collaborator("image encoding", err.to_string()))?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn write_test_image(path: &Path, width: u32, height: u32) {
        let image = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        image.save(path).expect("save test image");
    }

    #[test]
    fn images_to_pdf_emits_one_page_per_image() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = dir.path().join("a.jpg");
        let second = dir.path().join("b.jpg");
        write_test_image(&first, 40, 30);
        write_test_image(&second, 20, 20);

        let out = dir.path().join("jpg-to-pdf.pdf");
        images_to_pdf(&[first, second], &out, 90).expect("pdf");

        let doc = Document::load(&out).expect("load pdf");
        assert_eq!(doc.get_pages().len(), 2);
    }

    #[test]
    fn images_to_pdf_requires_at_least_one_image() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("empty.pdf");
        let result = images_to_pdf(&[], &out, 90);
        assert!(matches!(result, Err(ConversionError::Upload { .. })));
    }

    #[test]
    fn reencode_converts_png_to_jpeg() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("input.png");
        write_test_image(&input, 16, 16);

        let out = dir.path().join("converted.jpg");
        reencode(&input, "jpeg", &out, 90).expect("reencode");

        let round_trip = image::open(&out).expect("decode output");
        assert_eq!(round_trip.width(), 16);
        assert_eq!(round_trip.height(), 16);
    }

    #[test]
    fn reencode_rejects_unknown_formats() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("input.png");
        write_test_image(&input, 8, 8);

        let result = reencode(&input, "exr", &dir.path().join("out.exr"), 90);
        assert!(matches!(
            result,
            Err(ConversionError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn reencode_encodes_jpeg_at_the_requested_quality() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("noisy.png");
        // High-frequency content so the quality setting dominates output size.
        let image = RgbImage::from_fn(256, 256, |x, y| {
            image::Rgb([
                (x.wrapping_mul(31) ^ y.wrapping_mul(17)) as u8,
                (x.wrapping_mul(7) ^ y.wrapping_mul(13)) as u8,
                (x ^ y) as u8,
            ])
        });
        image.save(&input).expect("save test image");

        let low = dir.path().join("low.jpg");
        let high = dir.path().join("high.jpg");
        reencode(&input, "jpg", &low, 35).expect("low quality");
        reencode(&input, "jpg", &high, 90).expect("high quality");

        let low_len = std::fs::metadata(&low).expect("low metadata").len();
        let high_len = std::fs::metadata(&high).expect("high metadata").len();
        assert!(
            high_len > low_len,
            "quality 90 output ({high_len} bytes) should exceed quality 35 output ({low_len} bytes)"
        );
    }
}
