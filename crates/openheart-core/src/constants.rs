//! Names shared between ingestion, the archive client and the sync protocol.

/// Extensions accepted from an uploaded archive. Everything else is ignored.
pub const ACCEPTED_EXTENSIONS: &[&str] = &["h5", "dat"];

/// Archive resource holding the raw standard-format file of a scan.
pub const RAW_RESOURCE: &str = "MR_RAW";
pub const RAW_RESOURCE_FORMAT: &str = "HDF5";
pub const RAW_RESOURCE_CONTENT: &str = "RAW";

/// Archive resource the reconstruction pipeline writes derived images to.
pub const DICOM_RESOURCE: &str = "DICOM";

/// Archive resource holding preview snapshots attached at publish time.
pub const SNAPSHOT_RESOURCE: &str = "SNAPSHOTS";
pub const SNAPSHOT_FORMAT: &str = "GIF";
pub const SNAPSHOT_CONTENT_THUMBNAIL: &str = "THUMBNAIL";
pub const SNAPSHOT_CONTENT_OVERVIEW: &str = "ORIGINAL";

pub const SESSION_XSI_TYPE: &str = "xnat:mrSessionData";
pub const SCAN_XSI_TYPE: &str = "xnat:mrScanData";

/// Field carrying the series identifier of the derived images.
pub const SCAN_UID_FIELD: &str = "xnat:mrScanData/UID";

pub const EXPERIMENT_PREFIX: &str = "Exp-";
pub const SCAN_PREFIX: &str = "Scan-";

/// Date format used for experiment dates on the archive.
pub const EXPERIMENT_DATE_FORMAT: &str = "%Y-%m-%d";

/// Timestamp appended to subject labels; one per ingestion batch.
pub const BATCH_STAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S-%3f";
