// -
// Database namespaces

/// Sled database tree namespaces
pub(crate) const STATE_MACHINE_TREE: &str = "_state_machine_tree";
pub(crate) const STATE_MACHINE_META_TREE: &str = "_state_machine_metadata";

/// Sled entry key namespaces
pub(crate) const META_KEY_LAST_APPLIED_INDEX: &str = "_rsm_last_applied_index";
pub(crate) const META_KEY_LAST_APPLIED_TERM: &str = "_rsm_last_applied_term";

/// On-disk store generation directories, `gen-<last_included_index>`
pub(crate) const STORE_GENERATION_PREFIX: &str = "gen-";

/// Snapshot file naming
pub(crate) const SNAPSHOT_FILE_PREFIX: &str = "snapshot-";
pub(crate) const SNAPSHOT_TEMP_SUFFIX: &str = ".part";

// -
// Snapshot wire format

/// Format tag at offset 0 of every snapshot file
pub(crate) const SNAPSHOT_MAGIC: [u8; 8] = *b"RSMSNAP\x01";
pub(crate) const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Header flag bits
pub(crate) const SNAPSHOT_FLAG_COMPRESSED: u8 = 0b0000_0001;
