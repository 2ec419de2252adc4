use townward::config::Config;

#[test]
fn default_file_loads_back() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("config.toml");
    let path = path.to_string_lossy().to_string();

    tokio_test::block_on(Config::create_default(&path)).expect("write default");
    let config = tokio_test::block_on(Config::load(&path)).expect("load");
    assert_eq!(config.rules.overlay_distance, 2);
    assert!(config.rules.wild_place.contains("torch"));
    assert_eq!(config.rules_for("any_world").cell_size, 16);
}

#[tokio::test]
async fn mismatched_cell_size_is_rejected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let path = tmp.path().join("config.toml");
    tokio::fs::write(
        &path,
        r#"
[storage]
data_dir = "./data"

[logging]
level = "info"

[worlds.skylands]
cell_size = 32
"#,
    )
    .await
    .expect("write");
    let err = Config::load(&path.to_string_lossy())
        .await
        .expect_err("cell size override");
    assert!(err.to_string().contains("cell_size"));
}

#[tokio::test]
async fn missing_file_reports_path() {
    let err = Config::load("/nonexistent/townward.toml")
        .await
        .expect_err("missing");
    assert!(err.to_string().contains("/nonexistent/townward.toml"));
}
