#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

/// Temp dir holding an empty CLI config so the user's own config never leaks
/// into the run.
fn workspace() -> (TempDir, PathBuf, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let config = dir.path().join("config.toml");
    fs::write(&config, "").expect("write config");
    let image = dir.path().join("vol.img");
    (dir, config, image)
}

fn balfs(config: &Path, image: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("balfs");
    cmd.arg("--config").arg(config).arg("--image").arg(image);
    cmd
}

/// No `--image`: the path has to come from the config file.
fn configured(config: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("balfs");
    cmd.env_remove("BALFS_IMAGE").arg("--config").arg(config);
    cmd
}

fn json(output: &[u8]) -> Value {
    serde_json::from_slice(output).expect("json output")
}

fn mkfs(config: &Path, image: &Path) {
    balfs(config, image)
        .args(["mkfs", "--block-size", "1024", "--blocks", "4096", "--label", "cli"])
        .assert()
        .success();
}

#[test]
fn mkfs_then_stats_reports_geometry() {
    let (_dir, config, image) = workspace();
    mkfs(&config, &image);
    assert_eq!(fs::metadata(&image).unwrap().len(), 1024 * 4096);

    let output = balfs(&config, &image)
        .args(["--format", "json", "stats"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let stats = json(&output);
    assert_eq!(stats["image"]["block_size"], 1024);
    assert_eq!(stats["image"]["block_count"], 4096);
    assert_eq!(stats["image"]["label"], "cli");
    assert_eq!(stats["tree"]["height"], 1);
    assert_eq!(stats["tree"]["items"], 2);

    balfs(&config, &image)
        .args(["mkfs", "--blocks", "4096"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn put_ls_cat_round_trip() {
    let (dir, config, image) = workspace();
    mkfs(&config, &image);

    let source = dir.path().join("hello.txt");
    let body: Vec<u8> = (0..5000u32).map(|i| (i % 97) as u8 + b' ').collect();
    fs::write(&source, &body).unwrap();

    balfs(&config, &image).args(["mkdir", "/docs"]).assert().success();
    balfs(&config, &image)
        .args(["put", "/docs/hello.txt", "--from"])
        .arg(&source)
        .assert()
        .success();
    balfs(&config, &image)
        .args(["put", "/docs/note"])
        .write_stdin("abc")
        .assert()
        .success();
    balfs(&config, &image)
        .args(["put", "/docs/note", "--append"])
        .write_stdin("def")
        .assert()
        .success();

    let output = balfs(&config, &image)
        .args(["--format", "json", "ls", "/docs"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let rows = json(&output);
    let rows = rows.as_array().expect("array of entries");
    assert_eq!(rows.len(), 2);
    let hello = rows.iter().find(|r| r["name"] == "hello.txt").expect("hello.txt listed");
    assert_eq!(hello["size"], 5000);
    assert_eq!(hello["kind"], "file");

    balfs(&config, &image)
        .args(["cat", "/docs/hello.txt"])
        .assert()
        .success()
        .stdout(body);
    balfs(&config, &image)
        .args(["cat", "/docs/note"])
        .assert()
        .success()
        .stdout("abcdef");

    balfs(&config, &image).args(["rm", "/docs/note"]).assert().success();
    balfs(&config, &image)
        .args(["cat", "/docs/note"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn verify_passes_then_flags_a_damaged_root() {
    let (_dir, config, image) = workspace();
    mkfs(&config, &image);
    balfs(&config, &image)
        .args(["put", "/f"])
        .write_stdin("payload")
        .assert()
        .success();

    let output = balfs(&config, &image)
        .args(["--format", "json", "verify", "--level", "full"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report = json(&output);
    assert_eq!(report["success"], true);
    assert_eq!(report["counts"]["files"], 1);

    let output = balfs(&config, &image)
        .args(["--format", "json", "stats"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let root = json(&output)["tree"]["root_block"].as_u64().unwrap();

    let mut bytes = fs::read(&image).unwrap();
    let at = root as usize * 1024;
    bytes[at..at + 1024].fill(0xFF);
    fs::write(&image, bytes).unwrap();

    balfs(&config, &image)
        .args(["verify", "--level", "full"])
        .assert()
        .failure()
        .code(2);
    balfs(&config, &image)
        .args(["verify", "--level", "fast"])
        .assert()
        .success();
}

#[test]
fn dump_decodes_the_root_leaf() {
    let (_dir, config, image) = workspace();
    mkfs(&config, &image);
    balfs(&config, &image)
        .args(["put", "/foo"])
        .write_stdin("abc")
        .assert()
        .success();

    let output = balfs(&config, &image)
        .args(["--format", "json", "dump"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let dumps = json(&output);
    let root = &dumps[0];
    assert_eq!(root["kind"], "leaf");
    assert_eq!(root["detail"]["type"], "leaf");
    let items = root["detail"]["items"].as_array().unwrap();
    assert!(items.iter().any(|i| i["summary"] == "3 tail bytes"));

    let output = balfs(&config, &image)
        .args(["--format", "json", "dump", "--block", "64"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(json(&output)[0]["kind"], "superblock");
}

#[test]
fn config_supplies_the_image_and_format_defaults() {
    let (dir, _config, image) = workspace();
    let config = dir.path().join("custom.toml");
    fs::write(
        &config,
        format!(
            "[image]\ndefault = {:?}\n\n[format]\nblock_size = 2048\nblocks = 1024\nlabel = \"from-config\"\n",
            image.display().to_string()
        ),
    )
    .unwrap();

    configured(&config)
        .arg("mkfs")
        .assert()
        .success();
    assert_eq!(fs::metadata(&image).unwrap().len(), 2048 * 1024);

    let output = configured(&config)
        .args(["--format", "json", "stats"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(json(&output)["image"]["label"], "from-config");

    fs::write(&config, "[format]\nunknown = 1\n").unwrap();
    let output = configured(&config)
        .arg("stats")
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8_lossy(&output);
    assert!(stderr.contains("invalid config"), "{stderr}");
}
