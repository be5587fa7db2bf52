use std::io::Write;

use backflow::config::load_config;
use backflow::Config;

#[test]
fn load_config_matches_toml() {
    let cfg: Config = load_config("backflow.toml").expect("failed to load config");

    assert_eq!(cfg.server.bind_addr, "127.0.0.1:5005");
    assert_eq!(cfg.server.store_dir, "./received");
    assert_eq!(cfg.pipeline.chunk_size, 65_536);

    let source = cfg.pipeline.source_watermarks().unwrap();
    assert_eq!((source.high(), source.low()), (10, 5));
    let stage = cfg.pipeline.stage_watermarks().unwrap();
    assert_eq!((stage.high(), stage.low()), (5, 3));
    let inflight = cfg.transport.watermarks().unwrap();
    assert_eq!((inflight.high(), inflight.low()), (20, 10));
}

#[test]
fn missing_sections_fall_back_to_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[server]\nbind_addr = \"0.0.0.0:7000\"").unwrap();

    let cfg = load_config(file.path()).unwrap();
    assert_eq!(cfg.server.bind_addr, "0.0.0.0:7000");
    assert_eq!(cfg.server.store_dir, Config::default().server.store_dir);
    assert_eq!(cfg.transport.inflight_high, 20);
}

#[test]
fn inverted_watermarks_are_rejected_at_load() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[pipeline]\nstage_high = 2\nstage_low = 4").unwrap();

    let err = load_config(file.path()).unwrap_err();
    assert!(err.to_string().contains("high (2) must be greater than low (4)"));
}

#[test]
fn zero_chunk_size_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[pipeline]\nchunk_size = 0").unwrap();

    assert!(load_config(file.path()).is_err());
}
