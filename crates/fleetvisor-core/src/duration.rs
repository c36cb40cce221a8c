//! 期間文字列のパース
//!
//! `5s`, `250ms`, `10m`, `2.5h`, `1d`, `1h30m` のような
//! 数値+単位トークンの連結を受け付けます。

use crate::error::{CoreError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// スケジュール間隔の下限（再起動ストーム防止）
pub const MIN_INTERVAL_SECS: u64 = 60;

/// スケジュール間隔の上限（365日）
pub const MAX_INTERVAL_SECS: u64 = 365 * 86400;

const SECS_PER_MINUTE: f64 = 60.0;
const SECS_PER_HOUR: f64 = 3600.0;
const SECS_PER_DAY: f64 = 86400.0;

/// 設定ファイル用の期間文字列をパース（単位: ms, s, m, h, d）
pub fn parse_duration(input: &str) -> Result<Duration> {
    let secs = parse_components(input, &["ms", "s", "m", "h", "d"])?;
    Duration::try_from_secs_f64(secs).map_err(|e| CoreError::InvalidDuration {
        input: input.to_string(),
        reason: e.to_string(),
    })
}

/// 数値+単位トークンを合計秒数に変換
fn parse_components(input: &str, allowed_units: &[&str]) -> Result<f64> {
    let text = input.trim().to_lowercase();
    let invalid = |reason: &str| CoreError::InvalidDuration {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    if text.is_empty() {
        return Err(invalid("空の文字列です"));
    }

    let mut total = 0.0;
    let mut rest = text.as_str();

    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (num_part, after_num) = rest.split_at(num_end);
        if num_part.is_empty() {
            return Err(invalid("数値が必要です"));
        }
        let value: f64 = num_part
            .parse()
            .map_err(|_| invalid(&format!("数値 '{}' を解釈できません", num_part)))?;

        let unit_end = after_num
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(after_num.len());
        let (unit, after_unit) = after_num.split_at(unit_end);
        if unit.is_empty() {
            return Err(invalid("単位が必要です"));
        }
        if !allowed_units.contains(&unit) {
            return Err(invalid(&format!(
                "未対応の単位 '{}'（利用可能: {}）",
                unit,
                allowed_units.join(", ")
            )));
        }

        total += value
            * match unit {
                "ms" => 0.001,
                "s" => 1.0,
                "m" => SECS_PER_MINUTE,
                "h" => SECS_PER_HOUR,
                "d" => SECS_PER_DAY,
                _ => unreachable!("unit is validated above"),
            };
        rest = after_unit.trim_start();
    }

    Ok(total)
}

/// スケジュール再起動の間隔
///
/// 単位は m / h / d のみ。小数（`2.5h`）と連結（`1h30m`）を受け付け、
/// [`MIN_INTERVAL_SECS`] 未満は拒否します。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval {
    secs: u64,
}

impl Interval {
    pub fn parse(input: &str) -> Result<Self> {
        let secs = parse_components(input, &["m", "h", "d"])?.round();
        if !secs.is_finite() || secs > MAX_INTERVAL_SECS as f64 {
            return Err(CoreError::IntervalTooLong {
                input: input.to_string(),
                max_secs: MAX_INTERVAL_SECS,
            });
        }
        if secs < MIN_INTERVAL_SECS as f64 {
            return Err(CoreError::IntervalTooShort {
                input: input.to_string(),
                min_secs: MIN_INTERVAL_SECS,
            });
        }
        Self::from_secs(secs as u64)
    }

    /// [`MIN_INTERVAL_SECS`] 以上 [`MAX_INTERVAL_SECS`] 以下のみ受け付ける
    pub fn from_secs(secs: u64) -> Result<Self> {
        if secs < MIN_INTERVAL_SECS {
            return Err(CoreError::IntervalTooShort {
                input: format!("{}s", secs),
                min_secs: MIN_INTERVAL_SECS,
            });
        }
        if secs > MAX_INTERVAL_SECS {
            return Err(CoreError::IntervalTooLong {
                input: format!("{}s", secs),
                max_secs: MAX_INTERVAL_SECS,
            });
        }
        Ok(Self { secs })
    }

    pub fn as_secs(&self) -> u64 {
        self.secs
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.secs)
    }

    pub fn as_chrono(&self) -> chrono::Duration {
        i64::try_from(self.secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let days = self.secs / 86400;
        let hours = (self.secs % 86400) / 3600;
        let minutes = (self.secs % 3600) / 60;
        let seconds = self.secs % 60;

        let mut out = String::new();
        if days > 0 {
            out.push_str(&format!("{}d", days));
        }
        if hours > 0 {
            out.push_str(&format!("{}h", hours));
        }
        if minutes > 0 {
            out.push_str(&format!("{}m", minutes));
        }
        if seconds > 0 {
            out.push_str(&format!("{}s", seconds));
        }
        write!(f, "{}", out)
    }
}

impl std::str::FromStr for Interval {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.secs)
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Self::from_secs(secs).map_err(serde::de::Error::custom)
    }
}

/// `std::time::Duration` を秒数としてシリアライズする serde ヘルパー
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
    }

    #[test]
    fn test_parse_duration_compound_and_case() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration(" 1H 30M ").unwrap(), Duration::from_secs(5400));
    }

    #[test]
    fn test_parse_duration_errors() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("10w").is_err());
        assert!(parse_duration("1..5h").is_err());
    }

    #[test]
    fn test_interval_fractional() {
        let interval = Interval::parse("2.5h").unwrap();
        assert_eq!(interval.as_secs(), 9000);
        assert_eq!(interval.to_string(), "2h30m");
    }

    #[test]
    fn test_interval_units() {
        assert_eq!(Interval::parse("30m").unwrap().as_secs(), 1800);
        assert_eq!(Interval::parse("1d").unwrap().as_secs(), 86400);
        assert_eq!(Interval::parse("1d12h").unwrap().to_string(), "1d12h");
    }

    #[test]
    fn test_interval_rejects_seconds_unit() {
        // スケジュールでは秒・ミリ秒単位は使えない
        assert!(matches!(
            Interval::parse("90s"),
            Err(CoreError::InvalidDuration { .. })
        ));
    }

    #[test]
    fn test_interval_floor() {
        assert!(matches!(
            Interval::parse("0.5m"),
            Err(CoreError::IntervalTooShort { .. })
        ));
        assert!(Interval::parse("1m").is_ok());
    }

    #[test]
    fn test_interval_ceiling() {
        assert!(Interval::parse("365d").is_ok());
        assert!(matches!(
            Interval::parse("100000000d"),
            Err(CoreError::IntervalTooLong { .. })
        ));
        assert!(matches!(
            Interval::from_secs(u64::MAX),
            Err(CoreError::IntervalTooLong { .. })
        ));
        // 上限を超える永続化値も読み込み時に拒否
        assert!(serde_json::from_str::<Interval>("8640000000000").is_err());
    }

    #[test]
    fn test_interval_serde_as_seconds() {
        let interval = Interval::parse("2h").unwrap();
        let json = serde_json::to_string(&interval).unwrap();
        assert_eq!(json, "7200");

        let back: Interval = serde_json::from_str(&json).unwrap();
        assert_eq!(back, interval);

        // 下限未満の値は読み込み時にも拒否
        assert!(serde_json::from_str::<Interval>("30").is_err());
    }
}
