//! Acquisition header embedded in standard raw files, and its mapping onto archive scan fields.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use tokio::io::AsyncReadExt;

const OPEN_TAG: &[u8] = b"<ismrmrdHeader";
const CLOSE_TAG: &[u8] = b"</ismrmrdHeader>";
const SCAN_CHUNK_SIZE: usize = 1024 * 1024;
const MAX_HEADER_BYTES: usize = 16 * 1024 * 1024;

const FIELD_PREFIX: &str = "xnat:mrScanData";

#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("Failed to read raw file: {0}")]
    Io(#[from] io::Error),

    #[error("No acquisition header found")]
    NotFound,

    #[error("Acquisition header exceeds {0} bytes")]
    TooLarge(usize),

    #[error("Acquisition header is not valid UTF-8")]
    Encoding,

    #[error("Malformed acquisition header: {0}")]
    Xml(#[from] roxmltree::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Acquisition parameters relevant to the archive. Every field is optional; headers
/// written by different scanners omit different sections.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AcquisitionHeader {
    pub field_strength_t: Option<f64>,
    pub patient_position: Option<String>,
    pub recon_matrix: Option<Vec3>,
    pub recon_fov_mm: Option<Vec3>,
    pub partitions: Option<i64>,
    pub tr: Option<f64>,
    pub te: Option<f64>,
    pub ti: Option<f64>,
    pub flip_angle_deg: Option<f64>,
    pub sequence_type: Option<String>,
    pub echo_spacing: Option<f64>,
    pub coil_labels: Vec<String>,
    pub waveform_types: Vec<String>,
}

fn child<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn path<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    names: &[&str],
) -> Option<roxmltree::Node<'a, 'input>> {
    names.iter().try_fold(node, |n, name| child(n, name))
}

fn text(node: Option<roxmltree::Node<'_, '_>>) -> Option<String> {
    node.and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn number(node: Option<roxmltree::Node<'_, '_>>) -> Option<f64> {
    text(node).and_then(|t| t.parse().ok())
}

fn vec3(node: Option<roxmltree::Node<'_, '_>>) -> Option<Vec3> {
    let node = node?;
    Some(Vec3 {
        x: number(child(node, "x"))?,
        y: number(child(node, "y"))?,
        z: number(child(node, "z")).unwrap_or(1.0),
    })
}

impl AcquisitionHeader {
    pub fn parse(xml: &str) -> Result<Self, HeaderError> {
        let doc = roxmltree::Document::parse(xml)?;
        let root = doc.root_element();

        let encoding = child(root, "encoding");
        let recon = encoding.and_then(|e| child(e, "reconSpace"));
        let partitions = encoding
            .and_then(|e| path(e, &["encodingLimits", "kspace_encoding_step_2"]))
            .and_then(|limits| {
                let min = number(child(limits, "minimum"))?;
                let max = number(child(limits, "maximum"))?;
                Some((max - min) as i64 + 1)
            });

        let sequence = child(root, "sequenceParameters");
        let first = |name: &str| sequence.and_then(|s| number(child(s, name)));

        let system = child(root, "acquisitionSystemInformation");
        let coil_labels = system
            .map(|s| {
                s.children()
                    .filter(|n| n.is_element() && n.tag_name().name() == "coilLabel")
                    .filter_map(|c| text(child(c, "coilName")))
                    .collect()
            })
            .unwrap_or_default();
        let waveform_types = root
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "waveformInformation")
            .filter_map(|w| text(child(w, "waveformType")))
            .collect();

        Ok(AcquisitionHeader {
            field_strength_t: system.and_then(|s| number(child(s, "systemFieldStrength_T"))),
            patient_position: text(path(root, &["measurementInformation", "patientPosition"])),
            recon_matrix: vec3(recon.and_then(|r| child(r, "matrixSize"))),
            recon_fov_mm: vec3(recon.and_then(|r| child(r, "fieldOfView_mm"))),
            partitions,
            tr: first("TR"),
            te: first("TE"),
            ti: first("TI"),
            flip_angle_deg: first("flipAngle_deg"),
            sequence_type: sequence.and_then(|s| text(child(s, "sequence_type"))),
            echo_spacing: first("echo_spacing"),
            coil_labels,
            waveform_types,
        })
    }

    /// Archive scan fields for this header, keyed by their full field path.
    /// Absent header values produce no field.
    pub fn to_scan_fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        let mut put = |key: &str, value: String| {
            fields.insert(format!("{}/{}", FIELD_PREFIX, key), value);
        };

        if let Some(fs) = self.field_strength_t {
            put("fieldStrength", format!("{}T", fs));
        }
        if let Some(position) = &self.patient_position {
            put("parameters/subjectPosition", position.clone());
        }
        if let (Some(fov), Some(matrix)) = (self.recon_fov_mm, self.recon_matrix) {
            put("parameters/voxelRes/units", "mm".to_string());
            for (axis, f, m) in [("x", fov.x, matrix.x), ("y", fov.y, matrix.y), ("z", fov.z, matrix.z)] {
                if m > 0.0 {
                    put(&format!("parameters/voxelRes/{}", axis), (f / m).to_string());
                }
            }
        }
        if let Some(fov) = self.recon_fov_mm {
            put("parameters/fov/x", (fov.x as i64).to_string());
            put("parameters/fov/y", (fov.y as i64).to_string());
        }
        if let Some(matrix) = self.recon_matrix {
            put("parameters/matrix/x", (matrix.x as i64).to_string());
            put("parameters/matrix/y", (matrix.y as i64).to_string());
        }
        if let Some(partitions) = self.partitions {
            put("parameters/partitions", partitions.to_string());
        }
        if let Some(tr) = self.tr {
            put("parameters/tr", tr.to_string());
        }
        if let Some(te) = self.te {
            put("parameters/te", te.to_string());
        }
        if let Some(ti) = self.ti {
            put("parameters/ti", ti.to_string());
        }
        if let Some(flip) = self.flip_angle_deg {
            put("parameters/flip", (flip as i64).to_string());
        }
        if let Some(sequence) = &self.sequence_type {
            put("parameters/sequence", sequence.clone());
        }
        if let Some(spacing) = self.echo_spacing {
            put("parameters/echoSpacing", spacing.to_string());
        }
        if !self.coil_labels.is_empty() {
            put("coil", self.coil_labels.join(","));
        }
        if !self.waveform_types.is_empty() {
            put(
                "parameters/addParam[name=waveformTypes]",
                self.waveform_types.join(","),
            );
        }
        fields
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Locate the embedded XML header in a raw byte buffer.
pub fn extract_header_xml(bytes: &[u8]) -> Option<&[u8]> {
    let start = find(bytes, OPEN_TAG)?;
    let end = find(&bytes[start..], CLOSE_TAG)? + start + CLOSE_TAG.len();
    Some(&bytes[start..end])
}

/// Stream `path` until the embedded header is found and parse it. Only the header
/// bytes are kept in memory, never the whole file.
pub async fn read_header(path: &Path) -> Result<AcquisitionHeader, HeaderError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; SCAN_CHUNK_SIZE];
    let mut window: Vec<u8> = Vec::new();
    let mut in_header = false;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Err(HeaderError::NotFound);
        }
        window.extend_from_slice(&buf[..n]);

        if !in_header {
            match find(&window, OPEN_TAG) {
                Some(pos) => {
                    window.drain(..pos);
                    in_header = true;
                }
                None => {
                    // keep a tail long enough to catch a tag split across reads
                    let keep = OPEN_TAG.len() - 1;
                    if window.len() > keep {
                        window.drain(..window.len() - keep);
                    }
                    continue;
                }
            }
        }

        if let Some(xml) = extract_header_xml(&window) {
            let xml = std::str::from_utf8(xml).map_err(|_| HeaderError::Encoding)?;
            return AcquisitionHeader::parse(xml);
        }
        if window.len() > MAX_HEADER_BYTES {
            return Err(HeaderError::TooLarge(MAX_HEADER_BYTES));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = r#"<ismrmrdHeader xmlns="http://www.ismrm.org/ISMRMRD">
  <measurementInformation><patientPosition>HFS</patientPosition></measurementInformation>
  <acquisitionSystemInformation>
    <systemFieldStrength_T>1.5</systemFieldStrength_T>
    <coilLabel><coilNumber>0</coilNumber><coilName>Body</coilName></coilLabel>
    <coilLabel><coilNumber>1</coilNumber><coilName>Spine_1</coilName></coilLabel>
  </acquisitionSystemInformation>
  <encoding>
    <reconSpace>
      <matrixSize><x>256</x><y>208</y><z>1</z></matrixSize>
      <fieldOfView_mm><x>360.5</x><y>292.5</y><z>8</z></fieldOfView_mm>
    </reconSpace>
    <encodingLimits>
      <kspace_encoding_step_2><minimum>0</minimum><maximum>11</maximum><center>6</center></kspace_encoding_step_2>
    </encodingLimits>
  </encoding>
  <sequenceParameters>
    <TR>3.2</TR><TR>40.1</TR><TE>1.4</TE><TI>0</TI>
    <flipAngle_deg>62.5</flipAngle_deg><sequence_type>TrueFISP</sequence_type>
    <echo_spacing>3.1</echo_spacing>
  </sequenceParameters>
  <waveformInformation><waveformName>ecg</waveformName><waveformType>ecg</waveformType></waveformInformation>
  <waveformInformation><waveformName>resp</waveformName><waveformType>respiratory</waveformType></waveformInformation>
</ismrmrdHeader>"#;

    #[test]
    fn test_parse_header() {
        let header = AcquisitionHeader::parse(HEADER).unwrap();
        assert_eq!(header.field_strength_t, Some(1.5));
        assert_eq!(header.patient_position.as_deref(), Some("HFS"));
        assert_eq!(header.partitions, Some(12));
        assert_eq!(header.tr, Some(3.2));
        assert_eq!(header.coil_labels, vec!["Body", "Spine_1"]);
        assert_eq!(header.waveform_types, vec!["ecg", "respiratory"]);
    }

    #[test]
    fn test_scan_field_mapping() {
        let fields = AcquisitionHeader::parse(HEADER).unwrap().to_scan_fields();
        let get = |k: &str| fields.get(&format!("xnat:mrScanData/{}", k)).map(String::as_str);

        assert_eq!(get("fieldStrength"), Some("1.5T"));
        assert_eq!(get("parameters/subjectPosition"), Some("HFS"));
        assert_eq!(get("parameters/voxelRes/units"), Some("mm"));
        assert_eq!(get("parameters/voxelRes/z"), Some("8"));
        assert_eq!(get("parameters/fov/x"), Some("360"));
        assert_eq!(get("parameters/matrix/y"), Some("208"));
        assert_eq!(get("parameters/partitions"), Some("12"));
        assert_eq!(get("parameters/flip"), Some("62"));
        assert_eq!(get("parameters/sequence"), Some("TrueFISP"));
        assert_eq!(get("parameters/echoSpacing"), Some("3.1"));
        assert_eq!(get("coil"), Some("Body,Spine_1"));
        let x: f64 = get("parameters/voxelRes/x").unwrap().parse().unwrap();
        assert!((x - 360.5 / 256.0).abs() < 1e-9);
    }

    #[test]
    fn test_sparse_header_omits_fields() {
        let header = AcquisitionHeader::parse(
            "<ismrmrdHeader><sequenceParameters><TE>2.0</TE></sequenceParameters></ismrmrdHeader>",
        )
        .unwrap();
        let fields = header.to_scan_fields();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["xnat:mrScanData/parameters/te"], "2");
    }

    #[test]
    fn test_extract_from_binary_buffer() {
        let mut raw = vec![0x89u8, b'H', b'D', b'F', 0, 0, 0xff];
        raw.extend_from_slice(HEADER.as_bytes());
        raw.extend_from_slice(&[0u8, 1, 2, 3]);
        let xml = extract_header_xml(&raw).unwrap();
        assert!(xml.starts_with(b"<ismrmrdHeader"));
        assert!(xml.ends_with(b"</ismrmrdHeader>"));
    }

    #[tokio::test]
    async fn test_read_header_across_chunk_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.h5");
        // place the opening tag across the first read boundary
        let mut raw = vec![0u8; SCAN_CHUNK_SIZE - 5];
        raw.extend_from_slice(HEADER.as_bytes());
        raw.extend(std::iter::repeat(0u8).take(100));
        tokio::fs::write(&path, &raw).await.unwrap();

        let header = read_header(&path).await.unwrap();
        assert_eq!(header.sequence_type.as_deref(), Some("TrueFISP"));
    }

    #[tokio::test]
    async fn test_read_header_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.h5");
        tokio::fs::write(&path, vec![0u8; 4096]).await.unwrap();
        assert!(matches!(
            read_header(&path).await.unwrap_err(),
            HeaderError::NotFound
        ));
    }
}
