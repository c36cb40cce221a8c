//! スケジュール再起動

use crate::duration::Interval;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 定期再起動の設定と発火時刻
///
/// `next_fire_at` は常に `(last_fire_at または created_at) + interval` の
/// 位相に乗り、前方にのみ進みます。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub interval: Interval,
    /// スケジュールが設定された時刻
    pub created_at: DateTime<Utc>,
    /// 最後に発火した予定時刻
    pub last_fire_at: Option<DateTime<Utc>>,
    /// 次の発火予定時刻
    pub next_fire_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(interval: Interval, now: DateTime<Utc>) -> Self {
        Self {
            interval,
            created_at: now,
            last_fire_at: None,
            next_fire_at: shift(now, interval),
        }
    }

    /// 永続化された間隔と最終発火時刻から次回時刻を再計算
    pub fn recompute(&mut self) {
        let base = self.last_fire_at.unwrap_or(self.created_at);
        let next = shift(base, self.interval);
        if next > self.next_fire_at {
            self.next_fire_at = next;
        }
    }

    /// `fired_at` の発火を記録し、次回時刻を `now` より後まで進める
    ///
    /// 再起動にかかった時間で位相がずれないよう、`now` ではなく
    /// 予定時刻に間隔を加算します。停止期間中に取りこぼした回は
    /// まとめて1回として扱います。
    pub fn advance(&mut self, fired_at: DateTime<Utc>, now: DateTime<Utc>) {
        let mut next = shift(fired_at, self.interval);
        while next <= now && next < DateTime::<Utc>::MAX_UTC {
            next = shift(next, self.interval);
        }

        if next > self.next_fire_at {
            self.last_fire_at = Some(fired_at);
            self.next_fire_at = next;
        }
    }

    /// 次回発火までの残り時間（過ぎていればゼロ）
    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        (self.next_fire_at - now).max(chrono::Duration::zero())
    }
}

/// 表現できる範囲の終端で飽和する加算
fn shift(at: DateTime<Utc>, interval: Interval) -> DateTime<Utc> {
    at.checked_add_signed(interval.as_chrono())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
