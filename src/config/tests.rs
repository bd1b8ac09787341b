use std::io::Write;

use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
    assert_eq!(
        settings.cache.memory_max_entries.get(),
        DEFAULT_MEMORY_MAX_ENTRIES
    );
    assert!(settings.cache.disk_enabled);
    assert_eq!(settings.pipeline.generation_timeout, Duration::from_secs(60));
    assert_eq!(settings.remote.max_attempts.get(), 3);
    assert_eq!(settings.catalog.path, PathBuf::from(DEFAULT_CATALOG_PATH));
    assert_eq!(settings.policy, ZoomPolicy::default());
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn rejects_zero_values() {
    let mut raw = RawSettings::default();
    raw.cache.memory_max_entries = Some(0);
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.memory_max_entries",
            ..
        }
    ));

    let mut raw = RawSettings::default();
    raw.pipeline.progress_chunk_size = Some(0);
    assert!(Settings::from_raw(raw).is_err());

    let mut raw = RawSettings::default();
    raw.remote.max_attempts = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn entry_limit_cannot_exceed_memory_budget() {
    let mut raw = RawSettings::default();
    raw.cache.memory_max_bytes = Some(1024);
    raw.cache.memory_entry_limit_bytes = Some(4096);
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.memory_entry_limit_bytes",
            ..
        }
    ));
}

#[test]
fn non_monotonic_policy_is_rejected() {
    let mut raw = RawSettings::default();
    let mut tiers = default_tiers();
    tiers[1].tolerance = 1.0;
    raw.policy.tiers = Some(tiers);
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(err, LoadError::Invalid { key: "policy.tiers", .. }));
}

#[test]
fn config_file_is_layered_under_cli() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    writeln!(
        file,
        r#"
[server]
port = 9100

[cache]
disk_directory = "/var/cache/parcelmap"

[[policy.tiers]]
min_zoom = 0
tolerance = 0.02
max_features = 1000

[[policy.tiers]]
min_zoom = 12
tolerance = 0.001
max_features = 20000
"#
    )
    .expect("write config");

    let args = CliArgs::parse_from([
        "parcelmap",
        "--config-file",
        file.path().to_str().expect("utf-8 path"),
        "serve",
        "--cache-disk-directory",
        "/tmp/parcelmap-cache",
    ]);
    let settings = load(&args).expect("settings");

    assert_eq!(settings.server.addr.port(), 9100);
    assert_eq!(
        settings.cache.disk_directory,
        PathBuf::from("/tmp/parcelmap-cache")
    );
    let policy = settings.policy.resolve(11);
    assert_eq!(policy.tolerance, 0.02);
    assert_eq!(policy.max_features.get(), 1000);
    assert_eq!(settings.policy.resolve(12).max_features.get(), 20_000);
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["parcelmap"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_warm_arguments() {
    let args = CliArgs::parse_from([
        "parcelmap",
        "warm",
        "--layer",
        "12",
        "--zoom",
        "8",
        "13",
        "16",
        "--catalog-path",
        "/etc/parcelmap/layers.toml",
    ]);

    match args.command.expect("warm command") {
        Command::Warm(warm) => {
            assert_eq!(warm.layer, 12);
            assert_eq!(warm.zoom, vec![8, 13, 16]);
            assert_eq!(
                warm.storage.catalog_path.as_deref(),
                Some(std::path::Path::new("/etc/parcelmap/layers.toml"))
            );
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn warm_requires_a_zoom() {
    let parsed = CliArgs::try_parse_from(["parcelmap", "warm", "--layer", "3"]);
    assert!(parsed.is_err());
}

#[test]
fn parse_clear_cache_arguments() {
    let args = CliArgs::parse_from(["parcelmap", "clear-cache", "--layer", "5"]);
    match args.command.expect("clear-cache command") {
        Command::ClearCache(clear) => assert_eq!(clear.layer, Some(5)),
        _ => panic!("wrong command parsed"),
    }

    let args = CliArgs::parse_from(["parcelmap", "clear-cache"]);
    match args.command.expect("clear-cache command") {
        Command::ClearCache(clear) => assert_eq!(clear.layer, None),
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "parcelmap",
        "serve",
        "--server-host",
        "0.0.0.0",
        "--cache-disk-enabled",
        "false",
        "--pipeline-generation-timeout-seconds",
        "15",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
            assert_eq!(serve.overrides.cache_disk_enabled, Some(false));
            assert_eq!(serve.overrides.generation_timeout_seconds, Some(15));
        }
        _ => panic!("wrong command parsed"),
    }
}
