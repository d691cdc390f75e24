//! Integration tests for blobdir

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn blobdir() -> Command {
        let mut cmd = cargo_bin_cmd!("blobdir");
        cmd.env_remove("BLOBDIR_CONFIG").env_remove("RUST_LOG");
        cmd
    }

    /// Write a config whose store and cache live under `root`
    fn write_config(root: &Path, cache: &str) -> PathBuf {
        let path = root.join(format!("{}.toml", cache));
        let content = format!(
            "[store]\nroot = \"{}\"\ncontainer = \"index\"\n\n[cache]\ndir = \"{}\"\n",
            root.join("store").display(),
            root.join(cache).display()
        );
        std::fs::write(&path, content).unwrap();
        path
    }

    fn with_config(config: &Path) -> Command {
        let mut cmd = blobdir();
        cmd.arg("--config").arg(config);
        cmd
    }

    #[test]
    fn help_displays() {
        blobdir()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("read-through cache"));
    }

    #[test]
    fn version_displays() {
        blobdir()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("blobdir"));
    }

    #[test]
    fn config_path() {
        blobdir()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path(), "cache");

        with_config(&config)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[lock]"))
            .stdout(predicate::str::contains("lease_duration_secs = 60"));
    }

    #[test]
    fn invalid_config_is_reported() {
        let temp = TempDir::new().unwrap();
        let config = temp.path().join("bad.toml");
        std::fs::write(&config, "[lock]\nlease_duration_secs = 10\n").unwrap();

        with_config(&config)
            .args(["cat", "segments.gen"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn put_then_cat() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path(), "cache");
        let file = temp.path().join("segments.gen");
        std::fs::write(&file, b"hello").unwrap();

        with_config(&config)
            .arg("put")
            .arg(&file)
            .assert()
            .success()
            .stdout(predicate::str::contains("Published segments.gen"));

        with_config(&config)
            .args(["cat", "segments.gen"])
            .assert()
            .success()
            .stdout(predicate::eq(&b"hello"[..]));
    }

    #[test]
    fn stat_on_another_cache_downloads() {
        let temp = TempDir::new().unwrap();
        let writer = write_config(temp.path(), "writer-cache");
        let reader = write_config(temp.path(), "reader-cache");
        let file = temp.path().join("_0.cfs");
        std::fs::write(&file, b"hello").unwrap();

        with_config(&writer).arg("put").arg(&file).assert().success();

        with_config(&reader)
            .args(["stat", "_0.cfs", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"length\": 5"))
            .stdout(predicate::str::contains("\"was_fresh\": false"))
            .stdout(predicate::str::contains(
                "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
            ));

        with_config(&reader)
            .args(["stat", "_0.cfs", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"was_fresh\": true"));
    }

    #[test]
    fn cat_missing_object_is_empty() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path(), "cache");

        with_config(&config)
            .args(["cat", "_9.cfs"])
            .assert()
            .success()
            .stdout(predicate::str::is_empty());
    }

    #[test]
    fn lock_obtain_and_probe() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path(), "cache");

        with_config(&config)
            .args(["lock", "obtain", "write.lock"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Lock obtained"))
            .stdout(predicate::str::contains("Lock released"));

        with_config(&config)
            .args(["lock", "probe", "write.lock"])
            .assert()
            .success()
            .stdout(predicate::str::contains("unlocked"));
    }

    #[test]
    fn lock_break_without_holder() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path(), "cache");

        with_config(&config)
            .args(["lock", "obtain", "write.lock"])
            .assert()
            .success();

        with_config(&config)
            .args(["lock", "break", "write.lock"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Lock broken"));
    }

    #[test]
    fn invalid_name_fails_with_hint() {
        let temp = TempDir::new().unwrap();
        let config = write_config(temp.path(), "cache");

        with_config(&config)
            .args(["cat", "../escape"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"))
            .stderr(predicate::str::contains("Hint:"));
    }
}
