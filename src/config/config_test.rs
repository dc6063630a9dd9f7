use super::*;

#[test]
fn test_default_settings_are_valid() {
    let settings = Settings::default();
    settings.validate().expect("defaults should validate");
    assert_eq!(settings.snapshot.chunk_size, 1024 * 1024);
    assert!(settings.machine.on_disk_full_export);
}

#[test]
fn test_load_without_file_uses_defaults() {
    let settings = Settings::load(None).expect("should succeed");
    assert_eq!(settings.machine.sled_cache_capacity, 10 * 1024 * 1024);
}

#[test]
fn test_zero_chunk_size_is_rejected() {
    let mut settings = Settings::default();
    settings.snapshot.chunk_size = 0;
    assert!(settings.validate().is_err());
}

#[test]
fn test_empty_data_dir_is_rejected() {
    let mut settings = Settings::default();
    settings.machine.data_dir = std::path::PathBuf::new();
    assert!(settings.validate().is_err());
}

#[test]
fn test_replica_dir_layout() {
    let settings = Settings::default();
    let dir = settings.machine.replica_dir(7, 2);
    assert!(dir.ends_with("group-7/replica-2"));
}
