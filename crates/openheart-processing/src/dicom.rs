//! Minimal reader for the derived images returned by reconstruction.
//!
//! Supports uncompressed little-endian Part-10 files (explicit and implicit VR) with
//! 8 or 16 bit monochrome pixel data, which is what the reconstruction pipeline emits.
//! Only the attributes needed to order frames and render previews are extracted.

use std::io;
use std::path::Path;

const PREAMBLE_LEN: usize = 128;
const MAGIC: &[u8] = b"DICM";

const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;
const ITEM: Tag = Tag(0xFFFE, 0xE000);
const ITEM_DELIMITER: Tag = Tag(0xFFFE, 0xE00D);
const SEQUENCE_DELIMITER: Tag = Tag(0xFFFE, 0xE0DD);

const TRANSFER_SYNTAX: Tag = Tag(0x0002, 0x0010);
const ECHO_TIME: Tag = Tag(0x0018, 0x0081);
const SERIES_INSTANCE_UID: Tag = Tag(0x0020, 0x000E);
const INSTANCE_NUMBER: Tag = Tag(0x0020, 0x0013);
const SLICE_LOCATION: Tag = Tag(0x0020, 0x1041);
const ROWS: Tag = Tag(0x0028, 0x0010);
const COLUMNS: Tag = Tag(0x0028, 0x0011);
const BITS_ALLOCATED: Tag = Tag(0x0028, 0x0100);
const PIXEL_REPRESENTATION: Tag = Tag(0x0028, 0x0103);
const RESCALE_INTERCEPT: Tag = Tag(0x0028, 0x1052);
const RESCALE_SLOPE: Tag = Tag(0x0028, 0x1053);
const PIXEL_DATA: Tag = Tag(0x7FE0, 0x0010);

/// VRs using the 2-byte reserved field plus 4-byte length in explicit encoding.
const LONG_VRS: &[&[u8; 2]] = &[
    b"OB", b"OD", b"OF", b"OL", b"OV", b"OW", b"SQ", b"SV", b"UC", b"UN", b"UR", b"UT", b"UV",
];

#[derive(Debug, thiserror::Error)]
pub enum DicomError {
    #[error("Failed to read image file: {0}")]
    Io(#[from] io::Error),

    #[error("Not a DICOM file")]
    NotDicom,

    #[error("Unexpected end of data at offset {0}")]
    Truncated(usize),

    #[error("Unsupported transfer syntax {0}")]
    UnsupportedTransferSyntax(String),

    #[error("Unsupported pixel layout: {0}")]
    UnsupportedPixels(String),

    #[error("Missing attribute {0}")]
    MissingAttribute(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tag(u16, u16);

#[derive(Debug, Clone, PartialEq)]
pub struct DicomImage {
    pub instance_number: Option<i32>,
    pub echo_time: Option<f64>,
    pub slice_location: Option<f64>,
    pub series_instance_uid: Option<String>,
    pub rows: u32,
    pub columns: u32,
    /// Rescaled pixel values in row-major order.
    pub pixels: Vec<f32>,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    explicit: bool,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DicomError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or(DicomError::Truncated(self.pos))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, DicomError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DicomError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Read one element header, returning the tag and value length.
    fn header(&mut self) -> Result<(Tag, u32), DicomError> {
        let tag = Tag(self.u16()?, self.u16()?);
        // item and delimiter tags never carry a VR
        if tag.0 == 0xFFFE || !self.explicit {
            return Ok((tag, self.u32()?));
        }
        let vr = self.take(2)?;
        let len = if LONG_VRS.iter().any(|v| v.as_slice() == vr) {
            self.take(2)?;
            self.u32()?
        } else {
            self.u16()? as u32
        };
        Ok((tag, len))
    }

    /// Skip an undefined-length sequence, including nested ones.
    fn skip_undefined(&mut self) -> Result<(), DicomError> {
        loop {
            let (tag, len) = self.header()?;
            if tag == SEQUENCE_DELIMITER {
                return Ok(());
            }
            if tag == ITEM && len == UNDEFINED_LENGTH {
                self.skip_item()?;
            } else {
                self.take(len as usize)?;
            }
        }
    }

    fn skip_item(&mut self) -> Result<(), DicomError> {
        loop {
            let (tag, len) = self.header()?;
            if tag == ITEM_DELIMITER {
                return Ok(());
            }
            if len == UNDEFINED_LENGTH {
                self.skip_undefined()?;
            } else {
                self.take(len as usize)?;
            }
        }
    }
}

fn text(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

fn decimal(value: &[u8]) -> Option<f64> {
    // multi-valued strings keep the first value
    text(value).split('\\').next()?.trim().parse().ok()
}

fn unsigned(value: &[u8]) -> Option<u32> {
    match value.len() {
        2 => Some(u16::from_le_bytes([value[0], value[1]]) as u32),
        4 => Some(u32::from_le_bytes([value[0], value[1], value[2], value[3]])),
        _ => None,
    }
}

#[derive(Default)]
struct Attributes<'a> {
    instance_number: Option<i32>,
    echo_time: Option<f64>,
    slice_location: Option<f64>,
    series_instance_uid: Option<String>,
    rows: Option<u32>,
    columns: Option<u32>,
    bits_allocated: Option<u32>,
    signed: bool,
    intercept: Option<f64>,
    slope: Option<f64>,
    pixel_data: Option<&'a [u8]>,
}

/// Parse a Part-10 file held in memory.
pub fn parse_dicom(data: &[u8]) -> Result<DicomImage, DicomError> {
    if data.len() < PREAMBLE_LEN + MAGIC.len() || &data[PREAMBLE_LEN..PREAMBLE_LEN + 4] != MAGIC {
        return Err(DicomError::NotDicom);
    }

    // file meta group is always explicit little endian
    let mut cursor = Cursor {
        data,
        pos: PREAMBLE_LEN + MAGIC.len(),
        explicit: true,
    };
    let mut transfer_syntax = None;
    while !cursor.at_end() {
        let start = cursor.pos;
        let group = cursor.u16()?;
        cursor.pos = start;
        if group != 0x0002 {
            break;
        }
        let (tag, len) = cursor.header()?;
        let value = cursor.take(len as usize)?;
        if tag == TRANSFER_SYNTAX {
            transfer_syntax = Some(text(value));
        }
    }

    cursor.explicit = match transfer_syntax.as_deref() {
        Some(EXPLICIT_VR_LE) => true,
        Some(IMPLICIT_VR_LE) | None => false,
        Some(other) => return Err(DicomError::UnsupportedTransferSyntax(other.to_string())),
    };

    let mut attrs = Attributes::default();
    while !cursor.at_end() {
        let (tag, len) = cursor.header()?;
        if len == UNDEFINED_LENGTH {
            if tag == PIXEL_DATA {
                return Err(DicomError::UnsupportedPixels("encapsulated pixel data".into()));
            }
            cursor.skip_undefined()?;
            continue;
        }
        let value = cursor.take(len as usize)?;
        match tag {
            INSTANCE_NUMBER => attrs.instance_number = decimal(value).map(|v| v as i32),
            ECHO_TIME => attrs.echo_time = decimal(value),
            SLICE_LOCATION => attrs.slice_location = decimal(value),
            SERIES_INSTANCE_UID => attrs.series_instance_uid = Some(text(value)),
            ROWS => attrs.rows = unsigned(value),
            COLUMNS => attrs.columns = unsigned(value),
            BITS_ALLOCATED => attrs.bits_allocated = unsigned(value),
            PIXEL_REPRESENTATION => attrs.signed = unsigned(value) == Some(1),
            RESCALE_INTERCEPT => attrs.intercept = decimal(value),
            RESCALE_SLOPE => attrs.slope = decimal(value),
            PIXEL_DATA => {
                attrs.pixel_data = Some(value);
                break;
            }
            _ => {}
        }
    }

    let rows = attrs.rows.ok_or(DicomError::MissingAttribute("Rows"))?;
    let columns = attrs.columns.ok_or(DicomError::MissingAttribute("Columns"))?;
    let data = attrs
        .pixel_data
        .ok_or(DicomError::MissingAttribute("PixelData"))?;
    let count = rows as usize * columns as usize;
    let slope = attrs.slope.unwrap_or(1.0) as f32;
    let intercept = attrs.intercept.unwrap_or(0.0) as f32;

    let raw: Vec<f32> = match (attrs.bits_allocated.unwrap_or(16), attrs.signed) {
        (8, _) => data.iter().take(count).map(|v| *v as f32).collect(),
        (16, false) => data
            .chunks_exact(2)
            .take(count)
            .map(|b| u16::from_le_bytes([b[0], b[1]]) as f32)
            .collect(),
        (16, true) => data
            .chunks_exact(2)
            .take(count)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32)
            .collect(),
        (bits, _) => {
            return Err(DicomError::UnsupportedPixels(format!(
                "{} bits allocated",
                bits
            )))
        }
    };
    if raw.len() < count {
        return Err(DicomError::UnsupportedPixels(format!(
            "expected {} pixels, found {}",
            count,
            raw.len()
        )));
    }

    Ok(DicomImage {
        instance_number: attrs.instance_number,
        echo_time: attrs.echo_time,
        slice_location: attrs.slice_location,
        series_instance_uid: attrs.series_instance_uid,
        rows,
        columns,
        pixels: raw.into_iter().map(|v| v * slope + intercept).collect(),
    })
}

pub async fn read_dicom(path: &Path) -> Result<DicomImage, DicomError> {
    let data = tokio::fs::read(path).await?;
    parse_dicom(&data)
}

/// Explicit-VR little-endian encoder for building fixtures.
#[cfg(any(test, feature = "test-util"))]
pub fn encode(image: &DicomImage) -> Vec<u8> {
    fn element(out: &mut Vec<u8>, tag: Tag, vr: &[u8; 2], value: &[u8]) {
        let mut value = value.to_vec();
        if value.len() % 2 == 1 {
            value.push(if vr == b"UI" || vr == b"OB" { 0 } else { b' ' });
        }
        out.extend_from_slice(&tag.0.to_le_bytes());
        out.extend_from_slice(&tag.1.to_le_bytes());
        out.extend_from_slice(vr);
        if LONG_VRS.contains(&vr) {
            out.extend_from_slice(&[0, 0]);
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        } else {
            out.extend_from_slice(&(value.len() as u16).to_le_bytes());
        }
        out.extend_from_slice(&value);
    }

    let mut out = vec![0u8; PREAMBLE_LEN];
    out.extend_from_slice(MAGIC);
    element(&mut out, TRANSFER_SYNTAX, b"UI", EXPLICIT_VR_LE.as_bytes());

    if let Some(te) = image.echo_time {
        element(&mut out, ECHO_TIME, b"DS", te.to_string().as_bytes());
    }
    if let Some(uid) = &image.series_instance_uid {
        element(&mut out, SERIES_INSTANCE_UID, b"UI", uid.as_bytes());
    }
    if let Some(n) = image.instance_number {
        element(&mut out, INSTANCE_NUMBER, b"IS", n.to_string().as_bytes());
    }
    if let Some(loc) = image.slice_location {
        element(&mut out, SLICE_LOCATION, b"DS", loc.to_string().as_bytes());
    }
    element(&mut out, ROWS, b"US", &(image.rows as u16).to_le_bytes());
    element(&mut out, COLUMNS, b"US", &(image.columns as u16).to_le_bytes());
    element(&mut out, BITS_ALLOCATED, b"US", &16u16.to_le_bytes());
    element(&mut out, PIXEL_REPRESENTATION, b"US", &0u16.to_le_bytes());
    let pixels: Vec<u8> = image
        .pixels
        .iter()
        .flat_map(|v| (v.clamp(0.0, u16::MAX as f32) as u16).to_le_bytes())
        .collect();
    element(&mut out, PIXEL_DATA, b"OW", &pixels);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DicomImage {
        DicomImage {
            instance_number: Some(7),
            echo_time: Some(1.25),
            slice_location: Some(-12.5),
            series_instance_uid: Some("1.2.3.4".into()),
            rows: 2,
            columns: 3,
            pixels: vec![0.0, 10.0, 20.0, 30.0, 40.0, 4095.0],
        }
    }

    #[test]
    fn test_parse_explicit_little_endian() {
        let image = parse_dicom(&encode(&sample())).unwrap();
        assert_eq!(image, sample());
    }

    #[test]
    fn test_rejects_non_dicom() {
        assert!(matches!(
            parse_dicom(b"not a dicom file").unwrap_err(),
            DicomError::NotDicom
        ));
        let mut data = vec![0u8; 200];
        data[128..132].copy_from_slice(b"DICX");
        assert!(matches!(parse_dicom(&data).unwrap_err(), DicomError::NotDicom));
    }

    #[test]
    fn test_truncated_pixel_data() {
        let mut data = encode(&sample());
        data.truncate(data.len() - 4);
        assert!(matches!(
            parse_dicom(&data).unwrap_err(),
            DicomError::Truncated(_)
        ));
    }

    #[test]
    fn test_skips_undefined_length_sequence() {
        let mut data = vec![0u8; PREAMBLE_LEN];
        data.extend_from_slice(MAGIC);
        // meta: transfer syntax, implicit VR little endian
        data.extend_from_slice(&[0x02, 0x00, 0x10, 0x00, b'U', b'I', 18, 0]);
        data.extend_from_slice(b"1.2.840.10008.1.2\0");
        // (0008,1140) sequence of undefined length with one undefined-length item
        data.extend_from_slice(&[0x08, 0x00, 0x40, 0x11, 0xFF, 0xFF, 0xFF, 0xFF]);
        data.extend_from_slice(&[0xFE, 0xFF, 0x00, 0xE0, 0xFF, 0xFF, 0xFF, 0xFF]);
        data.extend_from_slice(&[0x08, 0x00, 0x50, 0x11, 4, 0, 0, 0]);
        data.extend_from_slice(b"1.2\0");
        data.extend_from_slice(&[0xFE, 0xFF, 0x0D, 0xE0, 0, 0, 0, 0]);
        data.extend_from_slice(&[0xFE, 0xFF, 0xDD, 0xE0, 0, 0, 0, 0]);
        // rows, columns, pixel data
        data.extend_from_slice(&[0x28, 0x00, 0x10, 0x00, 2, 0, 0, 0, 1, 0]);
        data.extend_from_slice(&[0x28, 0x00, 0x11, 0x00, 2, 0, 0, 0, 1, 0]);
        data.extend_from_slice(&[0xE0, 0x7F, 0x10, 0x00, 2, 0, 0, 0, 0x34, 0x12]);

        let image = parse_dicom(&data).unwrap();
        assert_eq!((image.rows, image.columns), (1, 1));
        assert_eq!(image.pixels, vec![0x1234 as f32]);
    }

    #[test]
    fn test_unsupported_transfer_syntax() {
        let mut data = vec![0u8; PREAMBLE_LEN];
        data.extend_from_slice(MAGIC);
        data.extend_from_slice(&[0x02, 0x00, 0x10, 0x00, b'U', b'I', 22, 0]);
        data.extend_from_slice(b"1.2.840.10008.1.2.4.50");
        assert!(matches!(
            parse_dicom(&data).unwrap_err(),
            DicomError::UnsupportedTransferSyntax(ts) if ts == "1.2.840.10008.1.2.4.50"
        ));
    }
}
