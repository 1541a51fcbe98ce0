//! OpenHeart file processing
//!
//! Everything that touches the bytes of a data item: content identity, raw-format
//! conversion, acquisition header mapping, derived-image decoding and preview rendering.

pub mod conversion;
pub mod dicom;
pub mod header;
pub mod identity;
pub mod preview;

pub use conversion::{output_path_for, ContainerConverter, ConversionError, FormatConverter};
pub use dicom::{parse_dicom, read_dicom, DicomError, DicomImage};
pub use header::{read_header, AcquisitionHeader, HeaderError};
pub use identity::{canonicalize, content_digest, Identity, IdentityError};
pub use preview::{
    build_preview, load_series, percentile_bounds, Colormap, ImageSeries, PreviewArtifacts,
    PreviewError, PreviewOptions,
};
