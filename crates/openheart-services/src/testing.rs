//! Fixtures shared by the service tests and the HTTP tests.

use async_trait::async_trait;
use openheart_processing::dicom::encode;
use openheart_processing::{output_path_for, ConversionError, DicomImage, FormatConverter};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;

/// Converter that writes the standard-format sibling without running a container.
/// Output bytes depend only on the input bytes.
#[derive(Debug, Clone, Default)]
pub struct FakeConverter {
    fail_when_name_contains: Option<String>,
}

impl FakeConverter {
    pub fn failing_on(fragment: impl Into<String>) -> Self {
        Self {
            fail_when_name_contains: Some(fragment.into()),
        }
    }
}

#[async_trait]
impl FormatConverter for FakeConverter {
    async fn convert(&self, input: &Path) -> Result<PathBuf, ConversionError> {
        let output = output_path_for(input);
        let name = input
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if let Some(fragment) = &self.fail_when_name_contains {
            if name.contains(fragment.as_str()) {
                return Err(ConversionError::Failed {
                    status: "exit status: 1".to_string(),
                    stderr: format!("cannot parse {}", name),
                });
            }
        }
        if tokio::fs::try_exists(&output).await.unwrap_or(true) {
            return Err(ConversionError::OutputExists(output));
        }
        let data = tokio::fs::read(input)
            .await
            .map_err(|_| ConversionError::MissingInput(input.to_path_buf()))?;
        let mut converted = b"ISMRMRD".to_vec();
        converted.extend_from_slice(&data);
        tokio::fs::write(&output, converted)
            .await
            .map_err(ConversionError::Spawn)?;
        Ok(output)
    }
}

/// In-memory zip with one stored file per entry.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in entries {
        writer.start_file(*name, FileOptions::default()).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Minimal standard-format file carrying an acquisition header.
pub fn raw_file_with_header(marker: &str) -> Vec<u8> {
    format!(
        "\u{89}HDF\r\n<?xml version=\"1.0\"?>\
         <ismrmrdHeader xmlns=\"http://www.ismrm.org/ISMRMRD\">\
         <acquisitionSystemInformation><systemFieldStrength_T>1.5</systemFieldStrength_T></acquisitionSystemInformation>\
         <sequenceParameters><TR>3.2</TR><TE>1.4</TE><flipAngle_deg>60</flipAngle_deg></sequenceParameters>\
         </ismrmrdHeader>\0{}",
        marker
    )
    .into_bytes()
}

/// Zip of a derived-image series laid out the way the archive returns a DICOM resource.
pub fn dicom_series_zip(slices: usize, frames: usize) -> Vec<u8> {
    let mut files = Vec::new();
    for s in 0..slices {
        for f in 0..frames {
            let instance = (s * frames + f + 1) as i32;
            let image = DicomImage {
                instance_number: Some(instance),
                echo_time: None,
                slice_location: Some(s as f64 * 8.0),
                series_instance_uid: Some("1.2.826.0.1.3680043.2".to_string()),
                rows: 8,
                columns: 8,
                pixels: (0..64).map(|p| (p * (f + 1)) as f32).collect(),
            };
            files.push((
                format!("scan/resources/DICOM/files/{:04}.dcm", instance),
                encode(&image),
            ));
        }
    }
    let entries: Vec<(&str, &[u8])> = files
        .iter()
        .map(|(name, data)| (name.as_str(), data.as_slice()))
        .collect();
    zip_bytes(&entries)
}
