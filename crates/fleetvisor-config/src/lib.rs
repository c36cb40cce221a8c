//! FleetVisor の設定ファイル探索
//!
//! 探索順:
//! 1. 環境変数 `FLEETVISOR_CONFIG`（指定先が無ければエラー）
//! 2. プロジェクトディレクトリ: fleetvisor.local.kdl, .fleetvisor.local.kdl, fleetvisor.kdl, .fleetvisor.kdl
//! 3. プロジェクトの `.fleetvisor/` ディレクトリ: 同様の順序
//! 4. `~/.config/fleetvisor/fleetvisor.kdl`（グローバル設定）

pub mod error;

pub use error::*;

use std::path::{Path, PathBuf};

/// 設定ファイルを直接指定する環境変数
pub const CONFIG_ENV_VAR: &str = "FLEETVISOR_CONFIG";

/// 状態ファイルのデフォルト名
pub const STATE_FILE_NAME: &str = "state.json";

/// プロジェクト内の設定ディレクトリ名
pub const PROJECT_DIR_NAME: &str = ".fleetvisor";

const CANDIDATES: [&str; 4] = [
    "fleetvisor.local.kdl",
    ".fleetvisor.local.kdl",
    "fleetvisor.kdl",
    ".fleetvisor.kdl",
];

/// 設定ファイルの見つかった場所
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    /// `FLEETVISOR_CONFIG` で指定された
    EnvVar,
    /// プロジェクトディレクトリ直下
    Project,
    /// プロジェクトの `.fleetvisor/` 内
    ProjectDir,
    /// ユーザーのグローバル設定
    Global,
}

/// 探索の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundConfig {
    pub path: PathBuf,
    pub source: ConfigSource,
}

/// 設定ファイルの探索条件
#[derive(Debug, Clone)]
pub struct ConfigSearch {
    explicit: Option<PathBuf>,
    project_dir: PathBuf,
    global_dir: Option<PathBuf>,
}

impl ConfigSearch {
    /// `project_dir` を起点に探索する（環境変数・グローバル設定は見ない）
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            explicit: None,
            project_dir: project_dir.into(),
            global_dir: None,
        }
    }

    /// 実行環境から探索条件を組み立てる
    ///
    /// カレントディレクトリ、`FLEETVISOR_CONFIG`、ユーザー設定ディレクトリを使う。
    pub fn from_env() -> Result<Self> {
        let explicit = std::env::var_os(CONFIG_ENV_VAR)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);
        Ok(Self::new(std::env::current_dir()?)
            .with_explicit(explicit)
            .with_global_dir(dirs::config_dir().map(|dir| dir.join("fleetvisor"))))
    }

    pub fn with_explicit(mut self, explicit: Option<PathBuf>) -> Self {
        self.explicit = explicit;
        self
    }

    pub fn with_global_dir(mut self, global_dir: Option<PathBuf>) -> Self {
        self.global_dir = global_dir;
        self
    }

    /// 確認する候補パス（優先順）
    pub fn candidates(&self) -> Vec<(PathBuf, ConfigSource)> {
        let project_dir = self.project_dir.join(PROJECT_DIR_NAME);
        let mut out: Vec<_> = CANDIDATES
            .iter()
            .map(|name| (self.project_dir.join(name), ConfigSource::Project))
            .chain(
                CANDIDATES
                    .iter()
                    .map(|name| (project_dir.join(name), ConfigSource::ProjectDir)),
            )
            .collect();
        if let Some(global_dir) = &self.global_dir {
            out.push((global_dir.join("fleetvisor.kdl"), ConfigSource::Global));
        }
        out
    }

    pub fn find(&self) -> Result<FoundConfig> {
        if let Some(path) = &self.explicit {
            if !path.is_file() {
                return Err(ConfigError::ExplicitConfigMissing { path: path.clone() });
            }
            return Ok(FoundConfig {
                path: path.clone(),
                source: ConfigSource::EnvVar,
            });
        }

        let candidates = self.candidates();
        if let Some((path, source)) = candidates.iter().find(|(path, _)| path.is_file()) {
            tracing::debug!(path = %path.display(), source = ?source, "config file found");
            return Ok(FoundConfig {
                path: path.clone(),
                source: *source,
            });
        }

        let searched = candidates
            .iter()
            .map(|(path, _)| format!("  - {}", path.display()))
            .collect::<Vec<_>>()
            .join("\n");
        Err(ConfigError::ConfigFileNotFound { searched })
    }
}

/// 実行環境に従って設定ファイルを探す
pub fn find_config_file() -> Result<PathBuf> {
    Ok(ConfigSearch::from_env()?.find()?.path)
}

/// FleetVisor のユーザー設定ディレクトリ（無ければ作成）
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("fleetvisor");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// 状態ファイルのパスを決定
///
/// 設定に `state-file` があれば設定ファイルのディレクトリ基準で解決し、
/// 無ければユーザー設定ディレクトリ配下の state.json を使う。
pub fn resolve_state_file(configured: Option<&Path>, config_file: &Path) -> Result<PathBuf> {
    match configured {
        Some(path) if path.is_absolute() => Ok(path.to_path_buf()),
        Some(path) => {
            let base = config_file.parent().unwrap_or_else(|| Path::new("."));
            Ok(base.join(path))
        }
        None => Ok(get_config_dir()?.join(STATE_FILE_NAME)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, "process \"mybot\" { image \"mybot:latest\"; }").unwrap();
    }

    #[test]
    fn test_local_override_wins_over_shared_config() {
        let project = tempfile::tempdir().unwrap();
        touch(&project.path().join("fleetvisor.kdl"));
        touch(&project.path().join("fleetvisor.local.kdl"));

        let found = ConfigSearch::new(project.path()).find().unwrap();
        assert_eq!(found.path, project.path().join("fleetvisor.local.kdl"));
        assert_eq!(found.source, ConfigSource::Project);
    }

    #[test]
    fn test_project_root_wins_over_dot_fleetvisor_dir() {
        let project = tempfile::tempdir().unwrap();
        touch(&project.path().join(".fleetvisor/fleetvisor.local.kdl"));
        touch(&project.path().join(".fleetvisor.kdl"));

        let found = ConfigSearch::new(project.path()).find().unwrap();
        assert_eq!(found.path, project.path().join(".fleetvisor.kdl"));
    }

    #[test]
    fn test_dot_fleetvisor_dir_is_searched() {
        let project = tempfile::tempdir().unwrap();
        touch(&project.path().join(".fleetvisor/fleetvisor.kdl"));

        let found = ConfigSearch::new(project.path()).find().unwrap();
        assert_eq!(found.path, project.path().join(".fleetvisor/fleetvisor.kdl"));
        assert_eq!(found.source, ConfigSource::ProjectDir);
    }

    #[test]
    fn test_global_config_is_last_resort() {
        let project = tempfile::tempdir().unwrap();
        let global = tempfile::tempdir().unwrap();
        touch(&global.path().join("fleetvisor.kdl"));

        let search = ConfigSearch::new(project.path())
            .with_global_dir(Some(global.path().to_path_buf()));
        let found = search.find().unwrap();
        assert_eq!(found.source, ConfigSource::Global);

        // プロジェクト側にあればそちらが優先
        touch(&project.path().join("fleetvisor.kdl"));
        assert_eq!(search.find().unwrap().source, ConfigSource::Project);
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let project = tempfile::tempdir().unwrap();
        touch(&project.path().join("fleetvisor.kdl"));
        let missing = project.path().join("prod.kdl");

        // 指定先が無い場合はプロジェクトの設定に黙って切り替えない
        let err = ConfigSearch::new(project.path())
            .with_explicit(Some(missing.clone()))
            .find()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ExplicitConfigMissing { path } if path == missing));
    }

    #[test]
    fn test_not_found_lists_searched_paths() {
        let project = tempfile::tempdir().unwrap();
        let err = ConfigSearch::new(project.path()).find().unwrap_err();

        let message = err.to_string();
        assert!(message.contains(".fleetvisor.local.kdl"));
        assert!(message.contains(&project.path().join(".fleetvisor").display().to_string()));
    }

    #[test]
    #[serial]
    fn test_from_env_reads_config_var() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("prod.kdl");
        touch(&config_path);

        unsafe {
            std::env::set_var(CONFIG_ENV_VAR, &config_path);
        }
        let result = find_config_file();
        unsafe {
            std::env::remove_var(CONFIG_ENV_VAR);
        }
        assert_eq!(result.unwrap(), config_path);
    }

    #[test]
    fn test_state_file_relative_to_config_file() {
        let config_file = Path::new("/srv/bots/.fleetvisor/fleetvisor.kdl");

        let relative = resolve_state_file(Some(Path::new("run/state.json")), config_file);
        assert_eq!(
            relative.unwrap(),
            PathBuf::from("/srv/bots/.fleetvisor/run/state.json")
        );

        let absolute = resolve_state_file(Some(Path::new("/var/lib/fleetvisor.json")), config_file);
        assert_eq!(absolute.unwrap(), PathBuf::from("/var/lib/fleetvisor.json"));
    }

    #[test]
    fn test_state_file_defaults_to_user_config_dir() {
        let state = resolve_state_file(None, Path::new("fleetvisor.kdl")).unwrap();
        assert!(state.ends_with(Path::new("fleetvisor").join(STATE_FILE_NAME)));
    }
}
