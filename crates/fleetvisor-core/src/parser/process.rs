//! process ノードのパース

use super::{first_string, is_valid_process_name, property, required_string};
use crate::duration::{Interval, parse_duration};
use crate::error::{CoreError, Result};
use crate::model::{ProcessDefinition, RestartPolicy};
use kdl::KdlNode;
use std::collections::HashMap;
use std::path::PathBuf;

/// process ノードをパース
///
/// ```kdl
/// process "mybot" {
///     image "ghcr.io/example/mybot:latest"
///     env { BOT_TOKEN "xxx" }
///     env-file "bots/mybot.env"
///     restart auto=#true max-crashes=3 window="10m"
///     schedule "2.5h"
/// }
/// ```
pub fn parse_process(node: &KdlNode) -> Result<ProcessDefinition> {
    let name = first_string(node)
        .ok_or_else(|| CoreError::InvalidConfig("process にはプロセス名が必要です".to_string()))?
        .to_string();

    if !is_valid_process_name(&name) {
        return Err(CoreError::InvalidConfig(format!(
            "プロセス名 '{}' は使用できません\n\nヒント:\n  • 英数字で始まり、英数字と - _ . のみを含む64文字以内の名前にしてください",
            name
        )));
    }

    let mut image_ref = None;
    let mut env = HashMap::new();
    let mut env_file = None;
    let mut restart_policy = RestartPolicy::default();
    let mut schedule = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "image" => {
                    image_ref = Some(required_string(child, &name)?);
                }
                "env" => {
                    env.extend(parse_env_block(child));
                }
                "env-file" => {
                    env_file = Some(PathBuf::from(required_string(child, &name)?));
                }
                "restart" => {
                    restart_policy = parse_restart(child, &name)?;
                }
                "schedule" => {
                    schedule = Some(Interval::parse(&required_string(child, &name)?)?);
                }
                other => {
                    tracing::warn!(process = %name, node = other, "unknown process setting; ignoring");
                }
            }
        }
    }

    let image_ref = image_ref
        .filter(|image| !image.trim().is_empty())
        .ok_or_else(|| CoreError::MissingImage(name.clone()))?;

    Ok(ProcessDefinition {
        name,
        image_ref,
        env,
        env_file,
        restart_policy,
        schedule,
    })
}

/// env ブロックをパース（`KEY "value"` の並び）
fn parse_env_block(node: &KdlNode) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    let Some(children) = node.children() else {
        return vars;
    };

    for var in children.nodes() {
        let key = var.name().value().to_string();
        let value = var
            .entries()
            .first()
            .map(|e| {
                let value = e.value();
                value
                    .as_string()
                    .map(|s| s.to_string())
                    .or_else(|| value.as_integer().map(|i| i.to_string()))
                    .or_else(|| value.as_float().map(|f| f.to_string()))
                    .or_else(|| value.as_bool().map(|b| b.to_string()))
                    .unwrap_or_default()
            })
            .unwrap_or_default();
        vars.insert(key, value);
    }
    vars
}

/// restart ノードをパース
fn parse_restart(node: &KdlNode, process: &str) -> Result<RestartPolicy> {
    let mut policy = RestartPolicy::default();

    if let Some(auto) = property(node, "auto") {
        policy.auto_restart = auto.as_bool().ok_or_else(|| {
            CoreError::InvalidConfig(format!(
                "{} の restart auto には #true か #false を指定してください",
                process
            ))
        })?;
    }

    if let Some(max) = property(node, "max-crashes") {
        policy.max_crash_restarts_per_window = max
            .as_integer()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| {
                CoreError::InvalidConfig(format!(
                    "{} の restart max-crashes には 0 以上の整数を指定してください",
                    process
                ))
            })?;
    }

    if let Some(window) = property(node, "window") {
        let text = window.as_string().ok_or_else(|| {
            CoreError::InvalidConfig(format!(
                "{} の restart window には \"10m\" のような文字列を指定してください",
                process
            ))
        })?;
        policy.window = parse_duration(text)?;
    }

    Ok(policy)
}
