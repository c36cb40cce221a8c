//! engine ノードのパース

use super::{first_string, property, required_string};
use crate::duration::parse_duration;
use crate::error::{CoreError, Result};
use crate::model::{EngineSettings, ExitDetection, ReconcilePolicy};
use kdl::KdlNode;
use std::path::PathBuf;

/// engine ノードをパース
pub fn parse_engine(node: &KdlNode) -> Result<EngineSettings> {
    let mut settings = EngineSettings::default();

    let Some(children) = node.children() else {
        return Ok(settings);
    };

    for child in children.nodes() {
        match child.name().value() {
            "exit-detection" => {
                let value = required_string(child, "engine")?;
                settings.exit_detection = ExitDetection::parse(&value).ok_or_else(|| {
                    CoreError::InvalidConfig(format!(
                        "exit-detection は events か poll を指定してください: {}",
                        value
                    ))
                })?;
            }
            "poll-interval" => {
                settings.poll_interval = parse_duration(&required_string(child, "engine")?)?;
            }
            "grace-period" => {
                settings.grace_period = parse_duration(&required_string(child, "engine")?)?;
            }
            "reconcile" => {
                let value = required_string(child, "engine")?;
                settings.reconcile = ReconcilePolicy::parse(&value).ok_or_else(|| {
                    CoreError::InvalidConfig(format!(
                        "reconcile は adopt か force-stop を指定してください: {}",
                        value
                    ))
                })?;
            }
            "backoff" => {
                if let Some(base) = property(child, "base").and_then(|v| v.as_string()) {
                    settings.backoff.base = parse_duration(base)?;
                }
                if let Some(max) = property(child, "max").and_then(|v| v.as_string()) {
                    settings.backoff.max = parse_duration(max)?;
                }
                if let Some(multiplier) = property(child, "multiplier") {
                    settings.backoff.multiplier = multiplier
                        .as_float()
                        .or_else(|| multiplier.as_integer().map(|v| v as f64))
                        .filter(|m| *m >= 1.0)
                        .ok_or_else(|| {
                            CoreError::InvalidConfig(
                                "backoff の multiplier は 1 以上の数値を指定してください"
                                    .to_string(),
                            )
                        })?;
                }
                if settings.backoff.base > settings.backoff.max {
                    return Err(CoreError::InvalidConfig(
                        "backoff の base が max を超えています".to_string(),
                    ));
                }
            }
            "lock-timeout" => {
                settings.lock_timeout = Some(parse_duration(&required_string(child, "engine")?)?);
            }
            "state-file" => {
                settings.state_file = Some(PathBuf::from(required_string(child, "engine")?));
            }
            "container-prefix" => {
                settings.container_prefix = required_string(child, "engine")?;
            }
            "pull-missing-images" => {
                settings.pull_missing_images = child
                    .entries()
                    .first()
                    .and_then(|e| e.value().as_bool())
                    .ok_or_else(|| {
                        CoreError::InvalidConfig(
                            "pull-missing-images には #true か #false を指定してください"
                                .to_string(),
                        )
                    })?;
            }
            other => {
                tracing::warn!(
                    node = other,
                    value = first_string(child).unwrap_or_default(),
                    "unknown engine setting; ignoring"
                );
            }
        }
    }

    if settings.poll_interval.is_zero() {
        return Err(CoreError::InvalidConfig(
            "poll-interval は 0 より大きい値を指定してください".to_string(),
        ));
    }

    Ok(settings)
}
