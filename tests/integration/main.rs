//! Integration tests for run-isolated

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// Workspace with a private config, store, cache and work dir
    struct Workspace {
        dir: TempDir,
    }

    impl Workspace {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            std::fs::write(
                dir.path().join("config.toml"),
                "[general]\naudit_log = false\n",
            )
            .unwrap();
            Self { dir }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn cmd(&self) -> Command {
            let mut cmd = cargo_bin_cmd!("run-isolated");
            cmd.env("RUN_ISOLATED_CONFIG", self.path("config.toml"));
            cmd
        }

        /// Add a file to the store and return its digest
        fn store_add(&self, name: &str, content: &str) -> String {
            let file = self.path(name);
            std::fs::write(&file, content).unwrap();
            let output = self
                .cmd()
                .args(["store", "--dir"])
                .arg(self.path("store"))
                .arg("add")
                .arg(&file)
                .output()
                .unwrap();
            assert!(output.status.success());
            String::from_utf8(output.stdout)
                .unwrap()
                .split_whitespace()
                .next()
                .unwrap()
                .to_string()
        }

        fn run(&self, hash: &str) -> Command {
            let mut cmd = self.cmd();
            cmd.arg("run")
                .args(["--hash", hash])
                .arg("--store")
                .arg(self.path("store"))
                .arg("--cache")
                .arg(self.path("cache"))
                .arg("--work-dir")
                .arg(self.path("work"));
            cmd
        }
    }

    fn is_empty_or_missing(dir: &Path) -> bool {
        std::fs::read_dir(dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }

    #[test]
    fn help_displays() {
        cargo_bin_cmd!("run-isolated")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("isolated manifest"));
    }

    #[test]
    fn version_displays() {
        cargo_bin_cmd!("run-isolated")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("run-isolated"));
    }

    #[test]
    fn config_path_honors_flag() {
        let ws = Workspace::new();
        ws.cmd()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let ws = Workspace::new();
        ws.cmd()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]"));
    }

    #[test]
    fn run_requires_hash() {
        cargo_bin_cmd!("run-isolated")
            .arg("run")
            .assert()
            .failure()
            .stderr(predicate::str::contains("--hash"));
    }

    #[test]
    fn invalid_hash_is_internal_error() {
        let ws = Workspace::new();
        ws.run("not-a-digest")
            .assert()
            .code(240)
            .stderr(predicate::str::contains("Error:"));
    }

    #[test]
    fn unknown_manifest_exits_241() {
        let ws = Workspace::new();
        std::fs::create_dir_all(ws.path("store")).unwrap();
        ws.run(&"0".repeat(64)).assert().code(241);
        assert!(is_empty_or_missing(&ws.path("work")));
    }

    #[test]
    fn store_add_prints_digest() {
        let ws = Workspace::new();
        let digest = ws.store_add("hello.txt", "hello\n");
        assert_eq!(digest.len(), 64);
        assert!(ws.path("store").join(&digest).exists());
    }

    #[cfg(unix)]
    #[test]
    fn runs_manifest_command_in_sandbox() {
        let ws = Workspace::new();
        let data = ws.store_add("data.txt", "payload\n");
        let manifest = format!(
            r#"{{"command": ["cat", "data.txt"], "files": {{"data.txt": "{}"}}}}"#,
            data
        );
        let hash = ws.store_add("manifest.json", &manifest);

        ws.run(&hash)
            .assert()
            .success()
            .stdout(predicate::str::contains("payload"));

        assert!(is_empty_or_missing(&ws.path("work")));
        assert!(ws.path("cache").join(&data).exists());
    }

    #[cfg(unix)]
    #[test]
    fn propagates_command_exit_code_and_extra_args() {
        let ws = Workspace::new();
        let manifest = r#"{"command": ["sh", "-c", "exit $0"], "files": {}}"#;
        let hash = ws.store_add("manifest.json", manifest);

        ws.run(&hash).arg("--").arg("7").assert().code(7);
    }

    #[test]
    fn missing_file_exits_242() {
        let ws = Workspace::new();
        let manifest = format!(
            r#"{{"command": ["true"], "files": {{"gone.bin": "{}"}}}}"#,
            "1".repeat(64)
        );
        let hash = ws.store_add("manifest.json", &manifest);

        ws.run(&hash).assert().code(242);
        assert!(is_empty_or_missing(&ws.path("work")));
    }

    #[test]
    fn cache_stats_on_empty_cache() {
        let ws = Workspace::new();
        ws.cmd()
            .args(["cache", "--dir"])
            .arg(ws.path("cache"))
            .arg("stats")
            .assert()
            .success()
            .stdout(predicate::str::contains("Entries"));
    }

    #[test]
    fn cache_clear_with_yes() {
        let ws = Workspace::new();
        ws.cmd()
            .args(["cache", "--dir"])
            .arg(ws.path("cache"))
            .args(["clear", "--yes"])
            .assert()
            .success();
    }

    #[test]
    fn completions_generate() {
        cargo_bin_cmd!("run-isolated")
            .args(["completions", "bash"])
            .assert()
            .success()
            .stdout(predicate::str::contains("run-isolated"));
    }
}
