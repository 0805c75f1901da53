use smon::config::{load_config, persist_settings, CliOverrides, FiltersConfig};
use smon::errors::SmonError;
use smon::runtime::ProductionFileSystem;
use std::fs;

fn overrides_for(path: &std::path::Path) -> CliOverrides {
    CliOverrides {
        config_path: Some(path.to_path_buf()),
        ..CliOverrides::default()
    }
}

#[test]
fn file_settings_load_and_interval_is_clamped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        r#"
[refresh]
interval_secs = 1
min_interval_secs = 3
max_interval_secs = 60

[filters]
user = "alice"
state = "running,pending"

[commands]
squeue = "/opt/slurm/bin/squeue"
"#,
    )
    .expect("write config");

    let cfg = load_config(&overrides_for(&path), &ProductionFileSystem).expect("load");
    assert_eq!(cfg.refresh.interval_secs, 3);
    assert_eq!(cfg.filters.user.as_deref(), Some("alice"));
    assert_eq!(cfg.commands.squeue, "/opt/slurm/bin/squeue");
    assert_eq!(cfg.commands.sinfo, "sinfo");
}

#[test]
fn cli_flags_win_over_the_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    fs::write(&path, "[filters]\nuser = \"alice\"\npartition = \"gpu\"\n").expect("write config");

    let overrides = CliOverrides {
        user: Some("bob".to_string()),
        refresh_secs: Some(9),
        ..overrides_for(&path)
    };
    let cfg = load_config(&overrides, &ProductionFileSystem).expect("load");
    assert_eq!(cfg.filters.user.as_deref(), Some("bob"));
    assert_eq!(cfg.filters.partition.as_deref(), Some("gpu"));
    assert_eq!(cfg.refresh.interval_secs, 9);
}

#[test]
fn malformed_toml_is_a_parse_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    fs::write(&path, "[refresh\ninterval_secs = ").expect("write config");

    let err = load_config(&overrides_for(&path), &ProductionFileSystem).expect_err("bad toml");
    assert!(matches!(err, SmonError::ConfigParse(_)));
}

#[test]
fn persisted_settings_keep_unrelated_keys_and_reload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("config.toml");
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(
        &path,
        "[commands]\nscancel = \"/usr/local/bin/scancel\"\n\n[filters]\npartition = \"cpu\"\n",
    )
    .expect("write config");

    let filters = FiltersConfig {
        user: Some("carol".to_string()),
        partition: None,
        state: Some("running".to_string()),
    };
    persist_settings(&ProductionFileSystem, &path, 15, &filters).expect("persist");

    let cfg = load_config(&overrides_for(&path), &ProductionFileSystem).expect("reload");
    assert_eq!(cfg.refresh.interval_secs, 15);
    assert_eq!(cfg.filters, filters);
    assert_eq!(cfg.commands.scancel, "/usr/local/bin/scancel");
}

#[test]
fn persisting_creates_the_config_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("smon").join("config.toml");

    persist_settings(&ProductionFileSystem, &path, 7, &FiltersConfig::default()).expect("persist");

    let written = fs::read_to_string(&path).expect("read back");
    assert!(written.contains("interval_secs = 7"));
}
