//! 状態の問い合わせ用スナップショット

use chrono::{DateTime, Utc};
use fleetvisor_core::{Interval, ProcessRecord, ProcessState};
use serde::Serialize;

/// プロセス1件の状態
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessStatus {
    pub name: String,
    pub state: ProcessState,
    pub image_ref: String,
    /// 保持中のコンテナ（短縮ID）
    pub container: Option<String>,
    pub auto_restart: bool,
    pub crash_count: u32,
    pub backoff_attempts: u32,
    pub last_exit_code: Option<i64>,
    pub last_transition_at: DateTime<Utc>,
    /// Running になってからの経過秒数（Running 以外は None）
    pub uptime_secs: Option<i64>,
    pub schedule: Option<ScheduleStatus>,
}

/// スケジュールの状態
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleStatus {
    pub interval: Interval,
    pub last_fire_at: Option<DateTime<Utc>>,
    pub next_fire_at: DateTime<Utc>,
    /// 次回までの残り秒数（過ぎていれば 0）
    pub remaining_secs: i64,
}

impl ProcessStatus {
    pub fn from_record(record: &ProcessRecord, now: DateTime<Utc>) -> Self {
        Self {
            name: record.name().to_string(),
            state: record.state(),
            image_ref: record.image_ref.clone(),
            container: record
                .container_handle()
                .map(|handle| handle.short_id().to_string()),
            auto_restart: record.restart_policy.auto_restart,
            crash_count: record.crash_count,
            backoff_attempts: record.backoff_attempts,
            last_exit_code: record.last_exit_code,
            last_transition_at: record.last_transition_at(),
            uptime_secs: (record.state() == ProcessState::Running)
                .then(|| (now - record.last_transition_at()).num_seconds().max(0)),
            schedule: record.schedule.as_ref().map(|schedule| ScheduleStatus {
                interval: schedule.interval,
                last_fire_at: schedule.last_fire_at,
                next_fire_at: schedule.next_fire_at,
                remaining_secs: schedule.remaining(now).num_seconds(),
            }),
        }
    }
}

/// 次回発火までの表示（"in 1h30m" / "overdue"）
pub fn describe_next_fire(next_fire_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let remaining = (next_fire_at - now).num_seconds();
    if remaining <= 0 {
        return "overdue".to_string();
    }
    format!("in {}", format_span(remaining))
}

/// 稼働時間の表示（"2h15m" など）
pub fn describe_uptime(secs: i64) -> String {
    format_span(secs.max(0))
}

fn format_span(secs: i64) -> String {
    let (days, hours, minutes) = (secs / 86_400, (secs % 86_400) / 3600, (secs % 3600) / 60);
    match (days, hours, minutes) {
        (0, 0, 0) => format!("{}s", secs),
        (0, 0, m) => format!("{}m", m),
        (0, h, 0) => format!("{}h", h),
        (0, h, m) => format!("{}h{}m", h, m),
        (d, 0, _) => format!("{}d", d),
        (d, h, _) => format!("{}d{}h", d, h),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fleetvisor_core::Schedule;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_describe_next_fire() {
        let now = t0();
        let at = |secs: i64| now + chrono::Duration::seconds(secs);

        assert_eq!(describe_next_fire(at(5400), now), "in 1h30m");
        assert_eq!(describe_next_fire(at(7200), now), "in 2h");
        assert_eq!(describe_next_fire(at(300), now), "in 5m");
        assert_eq!(describe_next_fire(at(42), now), "in 42s");
        assert_eq!(describe_next_fire(at(86_400 + 3 * 3600), now), "in 1d3h");
        assert_eq!(describe_next_fire(at(0), now), "overdue");
        assert_eq!(describe_next_fire(at(-60), now), "overdue");
    }

    #[test]
    fn test_status_from_record() {
        let mut record = ProcessRecord::new("mybot", "mybot:1.0", t0());
        record.schedule = Some(Schedule::new(Interval::parse("2h").unwrap(), t0()));

        let status = ProcessStatus::from_record(&record, t0() + chrono::Duration::minutes(30));
        assert_eq!(status.state, ProcessState::Stopped);
        assert!(status.container.is_none());
        assert_eq!(status.schedule.unwrap().remaining_secs, 90 * 60);

        let json = serde_json::to_value(ProcessStatus::from_record(&record, t0())).unwrap();
        assert_eq!(json["state"], "stopped");
        assert_eq!(json["schedule"]["interval"], 7200);
    }

    #[test]
    fn test_uptime_only_while_running() {
        let mut record = ProcessRecord::new("mybot", "mybot:1.0", t0());
        let now = t0() + chrono::Duration::minutes(135);
        assert_eq!(ProcessStatus::from_record(&record, now).uptime_secs, None);

        record.transition(ProcessState::Starting, t0()).unwrap();
        record.transition(ProcessState::Running, t0()).unwrap();
        let status = ProcessStatus::from_record(&record, now);
        assert_eq!(status.uptime_secs, Some(135 * 60));
        assert_eq!(describe_uptime(status.uptime_secs.unwrap()), "2h15m");
    }
}
