use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use inscribe_contracts::embed::{EmbedItem, EmbedOptions, WriteResult};
use inscribe_contracts::gallery::GalleryWriter;
use sha2::{Digest, Sha256};

use crate::error_chain_text;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
const XMP_KEYWORD: &[u8] = b"XML:com.adobe.xmp";
const IMAGE_DESCRIPTION_TAG: u16 = 0x010E;
const ASCII_FIELD_TYPE: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedFormat {
    Jpeg,
    Png,
    Webp,
    Unknown,
}

pub fn detect_format(bytes: &[u8]) -> DetectedFormat {
    if bytes.starts_with(&JPEG_SOI) {
        return DetectedFormat::Jpeg;
    }
    if bytes.starts_with(&PNG_SIGNATURE) {
        return DetectedFormat::Png;
    }
    if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP" {
        return DetectedFormat::Webp;
    }
    DetectedFormat::Unknown
}

/// Output of the pure byte transform: a fresh buffer plus flags recording
/// which metadata standard was written. The input buffer is never mutated,
/// so a failed transform leaves no partially corrupted file behind.
#[derive(Debug, Clone)]
pub struct EmbeddedBuffer {
    pub bytes: Vec<u8>,
    pub wrote_exif: bool,
    pub wrote_xmp: bool,
}

/// Embeds `caption` into a copy of `bytes`. JPEG gets an EXIF
/// `ImageDescription`, PNG gets an XMP `dc:description` packet; recognized
/// but unsupported formats (WEBP) pass through unchanged.
pub fn embed_caption_bytes(bytes: &[u8], caption: &str) -> Result<EmbeddedBuffer> {
    match detect_format(bytes) {
        DetectedFormat::Jpeg => Ok(EmbeddedBuffer {
            bytes: embed_jpeg_description(bytes, caption)?,
            wrote_exif: true,
            wrote_xmp: false,
        }),
        DetectedFormat::Png => Ok(EmbeddedBuffer {
            bytes: embed_png_xmp(bytes, caption)?,
            wrote_exif: false,
            wrote_xmp: true,
        }),
        DetectedFormat::Webp | DetectedFormat::Unknown => Ok(EmbeddedBuffer {
            bytes: bytes.to_vec(),
            wrote_exif: false,
            wrote_xmp: false,
        }),
    }
}

/// Writes captions into image files and registers the results with the
/// gallery. Individual calls are retryable: the source file is only ever
/// read, and all writes target fresh temp paths.
pub struct EmbedEngine {
    writer: Arc<dyn GalleryWriter>,
    options: EmbedOptions,
}

impl EmbedEngine {
    pub fn new(writer: Arc<dyn GalleryWriter>, options: EmbedOptions) -> Self {
        Self { writer, options }
    }

    pub fn embed_caption(
        &self,
        source: &Path,
        caption: &str,
        asset_id: Option<&str>,
    ) -> WriteResult {
        if caption.trim().is_empty() {
            return WriteResult::failure("Caption must not be empty");
        }
        if !source.exists() {
            return WriteResult::failure(format!(
                "Source file does not exist: {}",
                source.display()
            ));
        }
        match self.embed_inner(source, caption, asset_id) {
            Ok(result) => result,
            Err(err) => WriteResult::failure(error_chain_text(&err, 400)),
        }
    }

    /// Strictly sequential; no parallel writes.
    pub fn embed_captions_batch(&self, items: &[EmbedItem]) -> Vec<WriteResult> {
        items
            .iter()
            .map(|item| self.embed_caption(&item.source, &item.caption, item.asset_id.as_deref()))
            .collect()
    }

    fn embed_inner(
        &self,
        source: &Path,
        caption: &str,
        asset_id: Option<&str>,
    ) -> Result<WriteResult> {
        let bytes = fs::read(source)
            .with_context(|| format!("failed to read source {}", source.display()))?;

        if let Some(backup_dir) = self.options.backup_dir.as_deref() {
            backup_original(source, &bytes, backup_dir)?;
        }

        let embedded = embed_caption_bytes(&bytes, caption)?;
        if !embedded.wrote_exif && !embedded.wrote_xmp {
            // Documented limitation: the caller falls back to
            // create_xmp_sidecar when durable metadata is required.
            return Ok(WriteResult {
                success: true,
                asset_id: asset_id.map(str::to_string),
                error: None,
                wrote_exif: false,
                wrote_xmp: false,
            });
        }

        let extension = source
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("bin");
        let mut temp = tempfile::Builder::new()
            .prefix("inscribe-")
            .suffix(&format!(".{extension}"))
            .tempfile()
            .context("failed to create temp output file")?;
        temp.write_all(&embedded.bytes)
            .context("failed to write temp output file")?;
        temp.flush().ok();

        // Temp file is removed when `temp` drops, success or not.
        let created = self
            .writer
            .create_asset(temp.path())
            .context("gallery asset creation failed")?;
        if let Some(album_id) = self.options.album_id.as_deref() {
            self.writer
                .add_asset_to_album(&created, album_id)
                .with_context(|| format!("failed to link asset into album {album_id}"))?;
        }

        Ok(WriteResult {
            success: true,
            asset_id: Some(created),
            error: None,
            wrote_exif: embedded.wrote_exif,
            wrote_xmp: embedded.wrote_xmp,
        })
    }
}

fn backup_original(source: &Path, bytes: &[u8], backup_dir: &Path) -> Result<()> {
    fs::create_dir_all(backup_dir)
        .with_context(|| format!("failed to create backup dir {}", backup_dir.display()))?;
    let file_name = source
        .file_name()
        .context("source path has no file name")?;
    let backup_path = backup_dir.join(file_name);
    fs::write(&backup_path, bytes)
        .with_context(|| format!("failed to write backup {}", backup_path.display()))?;

    let digest = hex::encode(Sha256::digest(bytes));
    let digest_path = backup_path.with_extension(format!(
        "{}.sha256",
        backup_path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("bin")
    ));
    fs::write(&digest_path, format!("{digest}\n"))
        .with_context(|| format!("failed to write backup digest {}", digest_path.display()))?;
    Ok(())
}

/// Sidecar fallback for formats the embedder passes through (WEBP and
/// anything unrecognized). Writes `<stem>.xmp` next to the source.
pub fn create_xmp_sidecar(source: &Path, caption: &str) -> Result<PathBuf> {
    if caption.trim().is_empty() {
        bail!("Caption must not be empty");
    }
    let sidecar_path = source.with_extension("xmp");
    fs::write(&sidecar_path, build_xmp_packet(caption))
        .with_context(|| format!("failed to write sidecar {}", sidecar_path.display()))?;
    Ok(sidecar_path)
}

// --- JPEG / EXIF ---

/// Builds a minimal EXIF APP1 segment: little-endian TIFF header, IFD0 with
/// the single `ImageDescription` tag, null-terminated ASCII value.
fn build_exif_app1_segment(caption: &str) -> Result<Vec<u8>> {
    let mut description: Vec<u8> = caption
        .chars()
        .map(|ch| {
            if ch.is_ascii() && (ch == ' ' || ch.is_ascii_graphic()) {
                ch as u8
            } else {
                b'?'
            }
        })
        .collect();
    description.push(0);

    let value_count = description.len() as u32;
    // TIFF header (8) + entry count (2) + one entry (12) + next-IFD (4).
    let value_offset: u32 = 26;

    let mut tiff = Vec::with_capacity(26 + description.len());
    tiff.extend_from_slice(b"II");
    tiff.extend_from_slice(&42u16.to_le_bytes());
    tiff.extend_from_slice(&8u32.to_le_bytes());
    tiff.extend_from_slice(&1u16.to_le_bytes());
    tiff.extend_from_slice(&IMAGE_DESCRIPTION_TAG.to_le_bytes());
    tiff.extend_from_slice(&ASCII_FIELD_TYPE.to_le_bytes());
    tiff.extend_from_slice(&value_count.to_le_bytes());
    if description.len() <= 4 {
        let mut inline = [0u8; 4];
        inline[..description.len()].copy_from_slice(&description);
        tiff.extend_from_slice(&inline);
        tiff.extend_from_slice(&0u32.to_le_bytes());
    } else {
        tiff.extend_from_slice(&value_offset.to_le_bytes());
        tiff.extend_from_slice(&0u32.to_le_bytes());
        tiff.extend_from_slice(&description);
    }

    let payload_len = 6 + tiff.len();
    let segment_len = payload_len + 2;
    if segment_len > 0xFFFF {
        bail!("caption too long for a single EXIF segment");
    }

    let mut segment = Vec::with_capacity(segment_len + 2);
    segment.extend_from_slice(&[0xFF, 0xE1]);
    segment.extend_from_slice(&(segment_len as u16).to_be_bytes());
    segment.extend_from_slice(b"Exif\0\0");
    segment.extend_from_slice(&tiff);
    Ok(segment)
}

/// Splices a fresh EXIF APP1 into a JPEG stream. An existing APP1 is
/// replaced wholesale so readers never see duplicate EXIF blocks; otherwise
/// the segment lands right after SOI, past any JFIF APP0.
fn embed_jpeg_description(bytes: &[u8], caption: &str) -> Result<Vec<u8>> {
    if !bytes.starts_with(&JPEG_SOI) {
        bail!("not a JPEG stream");
    }
    let segment = build_exif_app1_segment(caption)?;

    let mut insert_at = 2usize;
    let mut existing_app1: Option<(usize, usize)> = None;
    let mut pos = 2usize;
    while pos + 4 <= bytes.len() && bytes[pos] == 0xFF {
        let marker = bytes[pos + 1];
        // Stop at SOS; everything after it is entropy-coded data.
        if marker == 0xDA || marker == 0xD9 {
            break;
        }
        if (0xD0..=0xD8).contains(&marker) || marker == 0x00 || marker == 0x01 {
            bail!("unexpected marker 0xFF{marker:02X} in JPEG header area");
        }
        let seg_len = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
        if seg_len < 2 || pos + 2 + seg_len > bytes.len() {
            bail!("corrupt JPEG segment length at offset {pos}");
        }
        let end = pos + 2 + seg_len;
        if marker == 0xE0 && existing_app1.is_none() && insert_at == pos {
            // Keep JFIF first, per convention.
            insert_at = end;
        }
        if marker == 0xE1 {
            existing_app1 = Some((pos, end));
            break;
        }
        pos = end;
    }

    let mut out = Vec::with_capacity(bytes.len() + segment.len());
    match existing_app1 {
        Some((start, end)) => {
            out.extend_from_slice(&bytes[..start]);
            out.extend_from_slice(&segment);
            out.extend_from_slice(&bytes[end..]);
        }
        None => {
            out.extend_from_slice(&bytes[..insert_at]);
            out.extend_from_slice(&segment);
            out.extend_from_slice(&bytes[insert_at..]);
        }
    }
    Ok(out)
}

/// Recovers the `ImageDescription` string from a JPEG's EXIF APP1, if any.
/// Handles both TIFF byte orders; returns `None` on anything malformed.
pub fn read_jpeg_description(bytes: &[u8]) -> Option<String> {
    if !bytes.starts_with(&JPEG_SOI) {
        return None;
    }
    let mut pos = 2usize;
    while pos + 4 <= bytes.len() && bytes[pos] == 0xFF {
        let marker = bytes[pos + 1];
        if marker == 0xDA || marker == 0xD9 {
            return None;
        }
        let seg_len = u16::from_be_bytes([*bytes.get(pos + 2)?, *bytes.get(pos + 3)?]) as usize;
        if seg_len < 2 || pos + 2 + seg_len > bytes.len() {
            return None;
        }
        if marker == 0xE1 {
            let payload = &bytes[pos + 4..pos + 2 + seg_len];
            if payload.starts_with(b"Exif\0\0") {
                return parse_tiff_description(&payload[6..]);
            }
        }
        pos += 2 + seg_len;
    }
    None
}

fn parse_tiff_description(tiff: &[u8]) -> Option<String> {
    let little_endian = match tiff.get(0..2)? {
        b"II" => true,
        b"MM" => false,
        _ => return None,
    };
    if read_u16(tiff, 2, little_endian)? != 42 {
        return None;
    }
    let ifd_offset = read_u32(tiff, 4, little_endian)? as usize;
    let entry_count = read_u16(tiff, ifd_offset, little_endian)? as usize;
    for idx in 0..entry_count {
        let entry = ifd_offset + 2 + idx * 12;
        let tag = read_u16(tiff, entry, little_endian)?;
        if tag != IMAGE_DESCRIPTION_TAG {
            continue;
        }
        if read_u16(tiff, entry + 2, little_endian)? != ASCII_FIELD_TYPE {
            return None;
        }
        let count = read_u32(tiff, entry + 4, little_endian)? as usize;
        let raw = if count <= 4 {
            tiff.get(entry + 8..entry + 8 + count)?
        } else {
            let offset = read_u32(tiff, entry + 8, little_endian)? as usize;
            tiff.get(offset..offset + count)?
        };
        let trimmed = raw.strip_suffix(&[0]).unwrap_or(raw);
        return Some(String::from_utf8_lossy(trimmed).into_owned());
    }
    None
}

fn read_u16(bytes: &[u8], offset: usize, little_endian: bool) -> Option<u16> {
    let raw: [u8; 2] = bytes.get(offset..offset + 2)?.try_into().ok()?;
    Some(if little_endian {
        u16::from_le_bytes(raw)
    } else {
        u16::from_be_bytes(raw)
    })
}

fn read_u32(bytes: &[u8], offset: usize, little_endian: bool) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(offset..offset + 4)?.try_into().ok()?;
    Some(if little_endian {
        u32::from_le_bytes(raw)
    } else {
        u32::from_be_bytes(raw)
    })
}

// --- PNG / XMP ---

const CRC_TABLE: [u32; 256] = build_crc_table();

const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 {
                0xEDB8_8320 ^ (c >> 1)
            } else {
                c >> 1
            };
            k += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
}

fn crc32(parts: &[&[u8]]) -> u32 {
    let mut c = 0xFFFF_FFFFu32;
    for part in parts {
        for byte in *part {
            c = CRC_TABLE[((c ^ *byte as u32) & 0xFF) as usize] ^ (c >> 8);
        }
    }
    c ^ 0xFFFF_FFFF
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

fn build_xmp_packet(caption: &str) -> String {
    format!(
        concat!(
            "<?xpacket begin=\"\u{FEFF}\" id=\"W5M0MpCehiHzreSzNTczkc9d\"?>\n",
            "<x:xmpmeta xmlns:x=\"adobe:ns:meta/\">\n",
            " <rdf:RDF xmlns:rdf=\"http://www.w3.org/1999/02/22-rdf-syntax-ns#\">\n",
            "  <rdf:Description rdf:about=\"\" xmlns:dc=\"http://purl.org/dc/elements/1.1/\">\n",
            "   <dc:description>\n",
            "    <rdf:Alt>\n",
            "     <rdf:li xml:lang=\"x-default\">{}</rdf:li>\n",
            "    </rdf:Alt>\n",
            "   </dc:description>\n",
            "  </rdf:Description>\n",
            " </rdf:RDF>\n",
            "</x:xmpmeta>\n",
            "<?xpacket end=\"w\"?>"
        ),
        escape_xml(caption)
    )
}

/// Uncompressed iTXt chunk with the standard XMP keyword: big-endian
/// length, type, data, CRC-32 over type + data.
fn build_xmp_itxt_chunk(caption: &str) -> Vec<u8> {
    let packet = build_xmp_packet(caption);
    let mut data = Vec::with_capacity(XMP_KEYWORD.len() + 5 + packet.len());
    data.extend_from_slice(XMP_KEYWORD);
    data.push(0); // keyword terminator
    data.push(0); // compression flag: uncompressed
    data.push(0); // compression method
    data.push(0); // empty language tag
    data.push(0); // empty translated keyword
    data.extend_from_slice(packet.as_bytes());

    let mut chunk = Vec::with_capacity(data.len() + 12);
    chunk.extend_from_slice(&(data.len() as u32).to_be_bytes());
    chunk.extend_from_slice(b"iTXt");
    chunk.extend_from_slice(&data);
    chunk.extend_from_slice(&crc32(&[b"iTXt", &data]).to_be_bytes());
    chunk
}

fn is_xmp_itxt(chunk_type: &[u8], data: &[u8]) -> bool {
    chunk_type == b"iTXt" && data.starts_with(XMP_KEYWORD) && data.get(XMP_KEYWORD.len()) == Some(&0)
}

/// Inserts (or replaces) the XMP iTXt chunk, splicing immediately before
/// IEND. IEND is located by scanning for its type signature from the tail.
fn embed_png_xmp(bytes: &[u8], caption: &str) -> Result<Vec<u8>> {
    if !bytes.starts_with(&PNG_SIGNATURE) {
        bail!("not a PNG stream");
    }

    // First pass drops any existing XMP chunk so repeated embeds replace
    // rather than accumulate.
    let mut cleaned = Vec::with_capacity(bytes.len());
    cleaned.extend_from_slice(&PNG_SIGNATURE);
    let mut pos = PNG_SIGNATURE.len();
    while pos + 8 <= bytes.len() {
        let length = u32::from_be_bytes(bytes[pos..pos + 4].try_into()?) as usize;
        let end = pos + 12 + length;
        if end > bytes.len() {
            bail!("truncated PNG chunk at offset {pos}");
        }
        let chunk_type = &bytes[pos + 4..pos + 8];
        let data = &bytes[pos + 8..pos + 8 + length];
        if !is_xmp_itxt(chunk_type, data) {
            cleaned.extend_from_slice(&bytes[pos..end]);
        }
        if chunk_type == b"IEND" {
            break;
        }
        pos = end;
    }

    let iend_at = find_iend_offset(&cleaned).context("PNG stream has no IEND chunk")?;
    let chunk = build_xmp_itxt_chunk(caption);
    let mut out = Vec::with_capacity(cleaned.len() + chunk.len());
    out.extend_from_slice(&cleaned[..iend_at]);
    out.extend_from_slice(&chunk);
    out.extend_from_slice(&cleaned[iend_at..]);
    Ok(out)
}

/// Offset of the IEND chunk's length field (4 bytes before the type tag).
fn find_iend_offset(bytes: &[u8]) -> Option<usize> {
    let type_at = bytes
        .windows(4)
        .rposition(|window| window == b"IEND")?;
    type_at.checked_sub(4)
}

/// Recovers the `dc:description` text from a PNG's XMP iTXt chunk, if any.
pub fn read_png_xmp_description(bytes: &[u8]) -> Option<String> {
    if !bytes.starts_with(&PNG_SIGNATURE) {
        return None;
    }
    let mut pos = PNG_SIGNATURE.len();
    while pos + 8 <= bytes.len() {
        let length = u32::from_be_bytes(bytes.get(pos..pos + 4)?.try_into().ok()?) as usize;
        let end = pos + 12 + length;
        if end > bytes.len() {
            return None;
        }
        let chunk_type = &bytes[pos + 4..pos + 8];
        let data = &bytes[pos + 8..pos + 8 + length];
        if is_xmp_itxt(chunk_type, data) {
            let text_start = XMP_KEYWORD.len() + 5;
            let packet = std::str::from_utf8(data.get(text_start..)?).ok()?;
            return extract_xmp_description(packet);
        }
        if chunk_type == b"IEND" {
            break;
        }
        pos = end;
    }
    None
}

fn extract_xmp_description(packet: &str) -> Option<String> {
    let li_start = packet.find("<rdf:li")?;
    let text_start = li_start + packet[li_start..].find('>')? + 1;
    let text_end = text_start + packet[text_start..].find("</rdf:li>")?;
    Some(unescape_xml(&packet[text_start..text_end]))
}

/// Format-dispatching reader used by metadata-reader hosts and tests.
pub fn read_embedded_description(bytes: &[u8]) -> Option<String> {
    match detect_format(bytes) {
        DetectedFormat::Jpeg => read_jpeg_description(bytes),
        DetectedFormat::Png => read_png_xmp_description(bytes),
        DetectedFormat::Webp | DetectedFormat::Unknown => None,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use inscribe_contracts::embed::{EmbedItem, EmbedOptions};
    use inscribe_contracts::gallery::GalleryWriter;

    use super::*;

    #[derive(Default)]
    struct CollectingWriter {
        assets: Mutex<Vec<(PathBuf, Vec<u8>)>>,
        albums: Mutex<Vec<(String, String)>>,
    }

    impl GalleryWriter for CollectingWriter {
        fn create_asset(&self, local_path: &Path) -> anyhow::Result<String> {
            let bytes = fs::read(local_path)?;
            let mut assets = self.assets.lock().unwrap();
            let id = format!("asset-{}", assets.len());
            assets.push((local_path.to_path_buf(), bytes));
            Ok(id)
        }

        fn add_asset_to_album(&self, asset_id: &str, album_id: &str) -> anyhow::Result<()> {
            self.albums
                .lock()
                .unwrap()
                .push((asset_id.to_string(), album_id.to_string()));
            Ok(())
        }
    }

    fn jpeg_fixture() -> anyhow::Result<Vec<u8>> {
        let img = image::RgbImage::from_fn(8, 8, |x, y| {
            image::Rgb([(x * 30) as u8, (y * 30) as u8, 90])
        });
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Jpeg)?;
        Ok(out)
    }

    fn png_fixture() -> anyhow::Result<Vec<u8>> {
        let img = image::RgbaImage::from_pixel(4, 4, image::Rgba([10, 20, 30, 255]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)?;
        Ok(out)
    }

    fn count_app1_segments(bytes: &[u8]) -> usize {
        let mut count = 0;
        let mut pos = 2;
        while pos + 4 <= bytes.len() && bytes[pos] == 0xFF {
            let marker = bytes[pos + 1];
            if marker == 0xDA || marker == 0xD9 {
                break;
            }
            let seg_len = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
            if marker == 0xE1 {
                count += 1;
            }
            pos += 2 + seg_len;
        }
        count
    }

    #[test]
    fn crc_table_matches_png_reference_value() {
        // Standard check value for the reflected polynomial.
        assert_eq!(crc32(&[b"IEND"]), 0xAE42_6082);
        assert_eq!(crc32(&[b"123456789"]), 0xCBF4_3926);
    }

    #[test]
    fn jpeg_round_trip_recovers_caption() -> anyhow::Result<()> {
        let source = jpeg_fixture()?;
        let caption = "a dog running through tall grass";
        let embedded = embed_caption_bytes(&source, caption)?;
        assert!(embedded.wrote_exif);
        assert!(!embedded.wrote_xmp);
        assert_eq!(
            read_jpeg_description(&embedded.bytes).as_deref(),
            Some(caption)
        );
        Ok(())
    }

    #[test]
    fn jpeg_existing_app1_is_replaced_not_duplicated() -> anyhow::Result<()> {
        let source = jpeg_fixture()?;
        let first = embed_caption_bytes(&source, "first caption here")?;
        assert_eq!(count_app1_segments(&first.bytes), 1);
        let second = embed_caption_bytes(&first.bytes, "second caption entirely")?;
        assert_eq!(count_app1_segments(&second.bytes), 1);
        assert_eq!(
            read_jpeg_description(&second.bytes).as_deref(),
            Some("second caption entirely")
        );
        Ok(())
    }

    #[test]
    fn jpeg_embed_is_idempotent_for_same_caption() -> anyhow::Result<()> {
        let source = jpeg_fixture()?;
        let once = embed_caption_bytes(&source, "same caption")?;
        let twice = embed_caption_bytes(&once.bytes, "same caption")?;
        assert_eq!(once.bytes, twice.bytes);
        Ok(())
    }

    #[test]
    fn jpeg_non_ascii_characters_become_question_marks() -> anyhow::Result<()> {
        let source = jpeg_fixture()?;
        let embedded = embed_caption_bytes(&source, "café in Zürich")?;
        assert_eq!(
            read_jpeg_description(&embedded.bytes).as_deref(),
            Some("caf? in Z?rich")
        );
        Ok(())
    }

    #[test]
    fn jpeg_short_caption_uses_inline_value() -> anyhow::Result<()> {
        // "cat" plus the null terminator fits the 4-byte inline field.
        let source = jpeg_fixture()?;
        let embedded = embed_caption_bytes(&source, "cat")?;
        assert_eq!(read_jpeg_description(&embedded.bytes).as_deref(), Some("cat"));
        Ok(())
    }

    #[test]
    fn jpeg_description_readable_from_big_endian_tiff() {
        // MM-order TIFF with one inline ImageDescription entry.
        let mut tiff = Vec::new();
        tiff.extend_from_slice(b"MM");
        tiff.extend_from_slice(&42u16.to_be_bytes());
        tiff.extend_from_slice(&8u32.to_be_bytes());
        tiff.extend_from_slice(&1u16.to_be_bytes());
        tiff.extend_from_slice(&0x010Eu16.to_be_bytes());
        tiff.extend_from_slice(&2u16.to_be_bytes());
        tiff.extend_from_slice(&4u32.to_be_bytes());
        tiff.extend_from_slice(b"dog\0");
        tiff.extend_from_slice(&0u32.to_be_bytes());

        let mut jpeg = vec![0xFF, 0xD8, 0xFF, 0xE1];
        jpeg.extend_from_slice(&((2 + 6 + tiff.len()) as u16).to_be_bytes());
        jpeg.extend_from_slice(b"Exif\0\0");
        jpeg.extend_from_slice(&tiff);
        jpeg.extend_from_slice(&[0xFF, 0xD9]);

        assert_eq!(read_jpeg_description(&jpeg).as_deref(), Some("dog"));
    }

    #[test]
    fn png_round_trip_keeps_valid_iend_and_crc() -> anyhow::Result<()> {
        let source = png_fixture()?;
        let caption = "lanterns & confetti above a \"quiet\" street <at dusk>";
        let embedded = embed_caption_bytes(&source, caption)?;
        assert!(embedded.wrote_xmp);

        // Still ends in a well-formed IEND chunk.
        let tail = &embedded.bytes[embedded.bytes.len() - 12..];
        assert_eq!(&tail[4..8], b"IEND");
        assert_eq!(u32::from_be_bytes(tail[0..4].try_into()?), 0);
        assert_eq!(
            u32::from_be_bytes(tail[8..12].try_into()?),
            crc32(&[b"IEND"])
        );

        // The inserted chunk's CRC validates against the standard algorithm.
        let mut pos = PNG_SIGNATURE.len();
        let mut validated = false;
        while pos + 8 <= embedded.bytes.len() {
            let length =
                u32::from_be_bytes(embedded.bytes[pos..pos + 4].try_into()?) as usize;
            let chunk_type = &embedded.bytes[pos + 4..pos + 8];
            let data = &embedded.bytes[pos + 8..pos + 8 + length];
            if chunk_type == b"iTXt" {
                let stored =
                    u32::from_be_bytes(embedded.bytes[pos + 8 + length..pos + 12 + length].try_into()?);
                assert_eq!(stored, crc32(&[chunk_type, data]));
                validated = true;
            }
            pos += 12 + length;
        }
        assert!(validated, "no iTXt chunk found");

        assert_eq!(
            read_png_xmp_description(&embedded.bytes).as_deref(),
            Some(caption)
        );
        Ok(())
    }

    #[test]
    fn png_utf8_caption_survives_round_trip() -> anyhow::Result<()> {
        let source = png_fixture()?;
        let caption = "café terrace at night — två koppar";
        let embedded = embed_caption_bytes(&source, caption)?;
        assert_eq!(
            read_png_xmp_description(&embedded.bytes).as_deref(),
            Some(caption)
        );
        Ok(())
    }

    #[test]
    fn png_embed_replaces_existing_xmp_chunk() -> anyhow::Result<()> {
        let source = png_fixture()?;
        let first = embed_caption_bytes(&source, "first")?;
        let second = embed_caption_bytes(&first.bytes, "second")?;

        let mut xmp_chunks = 0;
        let mut pos = PNG_SIGNATURE.len();
        while pos + 8 <= second.bytes.len() {
            let length = u32::from_be_bytes(second.bytes[pos..pos + 4].try_into()?) as usize;
            let chunk_type = &second.bytes[pos + 4..pos + 8];
            let data = &second.bytes[pos + 8..pos + 8 + length];
            if is_xmp_itxt(chunk_type, data) {
                xmp_chunks += 1;
            }
            pos += 12 + length;
        }
        assert_eq!(xmp_chunks, 1);
        assert_eq!(
            read_png_xmp_description(&second.bytes).as_deref(),
            Some("second")
        );
        Ok(())
    }

    #[test]
    fn png_embed_is_idempotent_for_same_caption() -> anyhow::Result<()> {
        let source = png_fixture()?;
        let once = embed_caption_bytes(&source, "same caption")?;
        let twice = embed_caption_bytes(&once.bytes, "same caption")?;
        assert_eq!(once.bytes, twice.bytes);
        Ok(())
    }

    #[test]
    fn webp_passes_through_unchanged() -> anyhow::Result<()> {
        let mut webp = Vec::new();
        webp.extend_from_slice(b"RIFF");
        webp.extend_from_slice(&16u32.to_le_bytes());
        webp.extend_from_slice(b"WEBP");
        webp.extend_from_slice(&[0u8; 16]);

        let embedded = embed_caption_bytes(&webp, "ignored caption")?;
        assert_eq!(embedded.bytes, webp);
        assert!(!embedded.wrote_exif);
        assert!(!embedded.wrote_xmp);
        assert_eq!(read_embedded_description(&webp), None);
        Ok(())
    }

    #[test]
    fn format_detection_by_magic_bytes() -> anyhow::Result<()> {
        assert_eq!(detect_format(&jpeg_fixture()?), DetectedFormat::Jpeg);
        assert_eq!(detect_format(&png_fixture()?), DetectedFormat::Png);
        assert_eq!(detect_format(b"GIF89a"), DetectedFormat::Unknown);
        Ok(())
    }

    #[test]
    fn engine_rejects_empty_caption_before_any_io() {
        let writer = Arc::new(CollectingWriter::default());
        let engine = EmbedEngine::new(writer.clone(), EmbedOptions::default());
        let result = engine.embed_caption(Path::new("/nonexistent.jpg"), "   ", None);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Caption must not be empty"));
        assert!(writer.assets.lock().unwrap().is_empty());
    }

    #[test]
    fn engine_rejects_missing_source() {
        let engine = Arc::new(EmbedEngine::new(
            Arc::new(CollectingWriter::default()),
            EmbedOptions::default(),
        ));
        let result = engine.embed_caption(Path::new("/no/such/file.jpg"), "a caption", None);
        assert!(!result.success);
        assert!(result
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("does not exist"));
    }

    #[test]
    fn engine_creates_asset_from_temp_file_and_cleans_up() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = temp.path().join("photo.jpg");
        fs::write(&source, jpeg_fixture()?)?;

        let writer = Arc::new(CollectingWriter::default());
        let engine = EmbedEngine::new(
            writer.clone(),
            EmbedOptions {
                album_id: Some("album-1".to_string()),
                ..EmbedOptions::default()
            },
        );
        let result = engine.embed_caption(&source, "a dog on a beach", Some("img-1"));
        assert!(result.success, "error: {:?}", result.error);
        assert!(result.wrote_exif);
        assert_eq!(result.asset_id.as_deref(), Some("asset-0"));

        let assets = writer.assets.lock().unwrap();
        let (temp_path, written) = &assets[0];
        assert!(!temp_path.exists(), "temp file should be gone");
        assert_eq!(
            read_jpeg_description(written).as_deref(),
            Some("a dog on a beach")
        );
        // Source untouched.
        assert_eq!(read_jpeg_description(&fs::read(&source)?), None);
        assert_eq!(
            writer.albums.lock().unwrap().as_slice(),
            &[("asset-0".to_string(), "album-1".to_string())]
        );
        Ok(())
    }

    #[test]
    fn engine_backs_up_original_with_digest() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = temp.path().join("photo.png");
        let original = png_fixture()?;
        fs::write(&source, &original)?;
        let backup_dir = temp.path().join("backups");

        let engine = EmbedEngine::new(
            Arc::new(CollectingWriter::default()),
            EmbedOptions {
                backup_dir: Some(backup_dir.clone()),
                ..EmbedOptions::default()
            },
        );
        let result = engine.embed_caption(&source, "rooftops at dawn", None);
        assert!(result.success, "error: {:?}", result.error);
        assert!(result.wrote_xmp);

        assert_eq!(fs::read(backup_dir.join("photo.png"))?, original);
        let digest = fs::read_to_string(backup_dir.join("photo.png.sha256"))?;
        assert_eq!(
            digest.trim(),
            hex::encode(sha2::Sha256::digest(&original))
        );
        Ok(())
    }

    #[test]
    fn batch_runs_sequentially_and_reports_per_item() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let good = temp.path().join("good.jpg");
        fs::write(&good, jpeg_fixture()?)?;

        let engine = EmbedEngine::new(
            Arc::new(CollectingWriter::default()),
            EmbedOptions::default(),
        );
        let results = engine.embed_captions_batch(&[
            EmbedItem {
                source: good,
                caption: "a boat near the shore".to_string(),
                asset_id: Some("img-1".to_string()),
            },
            EmbedItem {
                source: temp.path().join("missing.jpg"),
                caption: "never written".to_string(),
                asset_id: None,
            },
        ]);
        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        assert!(!results[1].success);
        Ok(())
    }

    #[test]
    fn sidecar_holds_escaped_caption() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = temp.path().join("clip.webp");
        fs::write(&source, b"RIFF\0\0\0\0WEBP")?;

        let sidecar = create_xmp_sidecar(&source, "fish & chips")?;
        assert_eq!(sidecar, temp.path().join("clip.xmp"));
        let content = fs::read_to_string(&sidecar)?;
        assert!(content.contains("fish &amp; chips"));
        assert!(content.contains("dc:description"));
        Ok(())
    }
}
