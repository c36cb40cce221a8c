//! env ファイル（KEY=VALUE 形式）の読み込み

use crate::error::{CoreError, Result};
use std::collections::HashMap;
use std::path::Path;

/// env ファイルを読み込んで環境変数マップを返す
pub fn load_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path).map_err(|e| CoreError::IoError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(parse_env(&content))
}

/// KEY=VALUE 行をパース
///
/// - 空行と `#` で始まる行は無視
/// - `export KEY=VALUE` も受け付ける
/// - 値を囲むシングル/ダブルクォートは除去
pub fn parse_env(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }

        vars.insert(key.to_string(), unquote(value.trim()).to_string());
    }

    vars
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
