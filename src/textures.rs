use std::{
    borrow::Cow,
    collections::HashMap,
    io::{Cursor, Read, Seek, Write},
};

use fast_image_resize::{PixelType, Resizer, images::Image};
use gltf::json::Root;
use image::{
    ExtendedColorType, ImageEncoder,
    codecs::{jpeg::JpegEncoder, png::PngEncoder},
};
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    policy::{self, TextureResize},
    shading::ShadingGraph,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureScope {
    /// Images sampled by any mesh's materials.
    Used,
    /// Every image in the container.
    All,
}

fn resize_pixels(
    pixels: Vec<u8>,
    src: (u32, u32),
    dst: (u32, u32),
    pixel_type: PixelType,
) -> Result<Vec<u8>> {
    let src_img = Image::from_vec_u8(src.0, src.1, pixels, pixel_type)
        .map_err(|e| Error::Texture(e.to_string()))?;
    let mut dst_img = Image::new(dst.0, dst.1, pixel_type);

    let mut resizer = Resizer::new();
    resizer
        .resize(&src_img, &mut dst_img, None)
        .map_err(|e| Error::Texture(e.to_string()))?;

    Ok(dst_img.buffer().to_vec())
}

fn resize_to_jpg<W: Write>(img_data: &[u8], width: u32, height: u32, mut buf: W) -> Result<()> {
    let img = image::load_from_memory(img_data)?.to_rgb8();
    let src = img.dimensions();
    let pixels = resize_pixels(img.into_raw(), src, (width, height), PixelType::U8x3)?;

    JpegEncoder::new(&mut buf).write_image(&pixels, width, height, ExtendedColorType::Rgb8)?;

    Ok(())
}

fn resize_to_png<W: Write>(img_data: &[u8], width: u32, height: u32, mut buf: W) -> Result<()> {
    let img = image::load_from_memory(img_data)?.to_rgba8();
    let src = img.dimensions();
    let pixels = resize_pixels(img.into_raw(), src, (width, height), PixelType::U8x4)?;

    PngEncoder::new(&mut buf).write_image(&pixels, width, height, ExtendedColorType::Rgba8)?;

    Ok(())
}

fn view_data<'a>(blob: &'a [u8], root: &Root, view: usize) -> Option<&'a [u8]> {
    let view = root.buffer_views.get(view)?;
    let offset = match view.byte_offset {
        Some(o) => o.0 as usize,
        None => 0,
    };
    let length = view.byte_length.0 as usize;

    blob.get(offset..(offset + length))
}

fn pad_to_4bytes(data: &mut Vec<u8>) {
    while data.len() % 4 != 0 {
        data.push(0);
    }
}

/// Downscales the embedded textures of a GLB that exceed `max_edge`.
///
/// Only images in `scope` are touched; everything else in the binary chunk is
/// carried over byte for byte, re-packed with 4-byte aligned views.
pub fn downscale<R: Read + Seek>(
    reader: &mut R,
    max_edge: u32,
    scope: TextureScope,
) -> Result<(Vec<u8>, Vec<TextureResize>)> {
    let o_data = gltf::Gltf::from_reader(reader)?;
    let o_blob = o_data
        .blob
        .as_deref()
        .ok_or_else(|| Error::Texture("container has no binary chunk".into()))?;
    let mut n_json = o_data.as_json().clone();

    if n_json.buffers.len() != 1 || n_json.buffers[0].uri.is_some() {
        return Err(Error::Texture(
            "only single-buffer glb files with embedded data are supported".into(),
        ));
    }

    let graph = ShadingGraph::from_document(&o_data.document);
    let images = match scope {
        TextureScope::Used => {
            let objects: Vec<_> = graph.object_ids().collect();
            graph.used_images(Some(&objects))
        }
        TextureScope::All => graph.used_images(None),
    };

    let mut replaced: HashMap<usize, Vec<u8>> = HashMap::new();
    let mut records = Vec::new();

    for id in images {
        let name = &graph.image(id).name;
        let Some(img) = graph.image(id).source.and_then(|i| n_json.images.get(i)) else {
            continue;
        };
        let Some(view_idx) = img.buffer_view.map(|v| v.value()) else {
            debug!(image = %name, "image is referenced by uri, leaving it alone");
            continue;
        };
        if replaced.contains_key(&view_idx) {
            continue;
        }
        let Some(data) = view_data(o_blob, &n_json, view_idx) else {
            warn!(image = %name, "buffer view out of range");
            continue;
        };
        let size = imagesize::blob_size(data).map_err(|e| Error::Texture(format!("{name}: {e}")))?;
        let from = (size.width as u32, size.height as u32);
        let Some(to) = policy::texture_target(from.0, from.1, max_edge) else {
            continue;
        };

        let mut encoded: Vec<u8> = Vec::new();
        let writer = Cursor::new(&mut encoded);
        match img.mime_type.as_ref().map(|m| m.0.as_str()) {
            Some("image/png") => resize_to_png(data, to.0, to.1, writer)?,
            Some("image/jpeg") => resize_to_jpg(data, to.0, to.1, writer)?,
            other => {
                warn!(image = %name, mime = ?other, "unsupported image format, not resized");
                continue;
            }
        }

        info!(image = %name, "resizing {}x{} -> {}x{}", from.0, from.1, to.0, to.1);
        replaced.insert(view_idx, encoded);
        records.push(TextureResize {
            image: name.clone(),
            from,
            to,
        });
    }

    let mut n_blob: Vec<u8> = Vec::new();
    for (idx, view) in n_json.buffer_views.iter_mut().enumerate() {
        let data = match replaced.get(&idx) {
            Some(d) => d.as_slice(),
            None => {
                let offset = view.byte_offset.map_or(0, |o| o.0 as usize);
                let length = view.byte_length.0 as usize;
                o_blob.get(offset..offset + length).ok_or_else(|| {
                    Error::Texture(format!("buffer view {idx} exceeds the binary chunk"))
                })?
            }
        };

        pad_to_4bytes(&mut n_blob);
        let offset = n_blob.len();
        n_blob.extend_from_slice(data);

        view.byte_offset = Some(offset.into());
        view.byte_length = data.len().into();
    }
    pad_to_4bytes(&mut n_blob);
    n_json.buffers[0].byte_length = n_blob.len().into();

    let mut json_bytes =
        gltf::json::serialize::to_vec(&n_json).map_err(|e| Error::Texture(e.to_string()))?;
    while json_bytes.len() % 4 != 0 {
        json_bytes.push(b' ');
    }

    let n_glb = gltf::binary::Glb {
        header: gltf::binary::Header {
            magic: *b"glTF",
            version: 2,
            length: (12 + 8 + json_bytes.len() + 8 + n_blob.len()) as u32,
        },
        json: Cow::Owned(json_bytes),
        bin: Some(Cow::Owned(n_blob)),
    };

    let mut result: Vec<u8> = Vec::new();
    let writer = Cursor::new(&mut result);

    n_glb.to_writer(writer)?;

    Ok((result, records))
}
