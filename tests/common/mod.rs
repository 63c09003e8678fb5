use std::path::Path;

use assert_cmd::Command;
use tempfile::TempDir;

pub fn ponybunny_bin() -> Command {
    #[allow(deprecated)]
    {
        Command::cargo_bin("ponybunny").expect("ponybunny test binary should build")
    }
}

/// A scratch directory holding `config.toml` whose database lives beside it.
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new(extra_config: &str) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let db = dir.path().join("ponybunny.db");
        let config = format!(
            "[state]\ndb_path = {:?}\n\n[daemon]\ninstance_id = \"cli-test\"\n\n{}",
            db.display().to_string(),
            extra_config
        );
        std::fs::write(dir.path().join("config.toml"), config).expect("write config");
        Self { dir }
    }

    pub fn config_path(&self) -> std::path::PathBuf {
        self.dir.path().join("config.toml")
    }

    pub fn cmd(&self) -> Command {
        let mut cmd = ponybunny_bin();
        cmd.env("PONYBUNNY_CONFIG", self.config_path())
            .env("RUST_LOG", "warn")
            .current_dir(self.dir.path());
        cmd
    }

    #[allow(dead_code)]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}
