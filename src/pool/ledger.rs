use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::macros::format_description;

pub const DAY_MS: u64 = 24 * HOUR_MS;
pub const HOUR_MS: u64 = 60 * 60 * 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub daily_buckets: usize,
    pub hourly_buckets: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily_buckets: 30,
            hourly_buckets: 24,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyBucket {
    pub day_start_ms: u64,
    pub date: String,
    pub allocations: u64,
    pub api_calls: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_response_time_ms: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HourlyBucket {
    pub hour_start_ms: u64,
    pub allocations: u64,
    pub api_calls: u64,
    pub average_response_time_ms: f64,
}

/// Per-instance allocation statistics with bounded daily/hourly rollups.
///
/// Every write keeps `total_api_calls == successful_requests + failed_requests`
/// and holds at most one bucket per UTC day / hour.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageLedger {
    pub instance_id: String,
    pub total_allocations: u64,
    pub total_api_calls: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_response_time_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at_ms: Option<u64>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    #[serde(default)]
    pub daily: Vec<DailyBucket>,
    #[serde(default)]
    pub hourly: Vec<HourlyBucket>,
}

impl UsageLedger {
    pub fn new(instance_id: impl Into<String>, now_ms: u64) -> Self {
        Self {
            instance_id: instance_id.into(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            ..Self::default()
        }
    }

    pub fn record_success(&mut self, latency_ms: u64, now_ms: u64, retention: RetentionPolicy) {
        let latency = latency_ms as f64;

        self.total_allocations = self.total_allocations.saturating_add(1);
        self.total_api_calls = self.total_api_calls.saturating_add(1);
        self.successful_requests = self.successful_requests.saturating_add(1);
        let samples = self.successful_requests.saturating_add(self.failed_requests);
        self.average_response_time_ms =
            running_mean(self.average_response_time_ms, samples, latency);
        self.last_used_at_ms = Some(now_ms);

        let daily = self.daily_bucket_mut(now_ms);
        daily.allocations = daily.allocations.saturating_add(1);
        daily.api_calls = daily.api_calls.saturating_add(1);
        daily.successful_requests = daily.successful_requests.saturating_add(1);
        let samples = daily.successful_requests.saturating_add(daily.failed_requests);
        daily.average_response_time_ms =
            running_mean(daily.average_response_time_ms, samples, latency);

        let hourly = self.hourly_bucket_mut(now_ms);
        hourly.allocations = hourly.allocations.saturating_add(1);
        hourly.api_calls = hourly.api_calls.saturating_add(1);
        hourly.average_response_time_ms =
            running_mean(hourly.average_response_time_ms, hourly.allocations, latency);

        self.evict(now_ms, retention);
        self.updated_at_ms = now_ms;
    }

    pub fn record_failure(&mut self, now_ms: u64, retention: RetentionPolicy) {
        self.total_api_calls = self.total_api_calls.saturating_add(1);
        self.failed_requests = self.failed_requests.saturating_add(1);

        let daily = self.daily_bucket_mut(now_ms);
        daily.api_calls = daily.api_calls.saturating_add(1);
        daily.failed_requests = daily.failed_requests.saturating_add(1);

        self.evict(now_ms, retention);
        self.updated_at_ms = now_ms;
    }

    /// Percentage of successful calls; 100 when nothing has been recorded.
    pub fn success_rate(&self) -> f64 {
        if self.total_api_calls == 0 {
            return 100.0;
        }
        self.successful_requests as f64 * 100.0 / self.total_api_calls as f64
    }

    fn daily_bucket_mut(&mut self, now_ms: u64) -> &mut DailyBucket {
        let day_start_ms = day_start(now_ms);
        let idx = match self
            .daily
            .iter()
            .position(|bucket| bucket.day_start_ms == day_start_ms)
        {
            Some(idx) => idx,
            None => {
                self.daily.push(DailyBucket {
                    day_start_ms,
                    date: format_day(day_start_ms),
                    ..DailyBucket::default()
                });
                self.daily.len() - 1
            }
        };
        &mut self.daily[idx]
    }

    fn hourly_bucket_mut(&mut self, now_ms: u64) -> &mut HourlyBucket {
        let hour_start_ms = hour_start(now_ms);
        let idx = match self
            .hourly
            .iter()
            .position(|bucket| bucket.hour_start_ms == hour_start_ms)
        {
            Some(idx) => idx,
            None => {
                self.hourly.push(HourlyBucket {
                    hour_start_ms,
                    ..HourlyBucket::default()
                });
                self.hourly.len() - 1
            }
        };
        &mut self.hourly[idx]
    }

    fn evict(&mut self, now_ms: u64, retention: RetentionPolicy) {
        let daily_keep = retention.daily_buckets.max(1);
        let oldest_day = day_start(now_ms).saturating_sub((daily_keep as u64 - 1) * DAY_MS);
        self.daily.retain(|bucket| bucket.day_start_ms >= oldest_day);
        self.daily.sort_by_key(|bucket| bucket.day_start_ms);
        if self.daily.len() > daily_keep {
            let excess = self.daily.len() - daily_keep;
            self.daily.drain(..excess);
        }

        let hourly_keep = retention.hourly_buckets.max(1);
        let oldest_hour = hour_start(now_ms).saturating_sub((hourly_keep as u64 - 1) * HOUR_MS);
        self.hourly.retain(|bucket| bucket.hour_start_ms >= oldest_hour);
        self.hourly.sort_by_key(|bucket| bucket.hour_start_ms);
        if self.hourly.len() > hourly_keep {
            let excess = self.hourly.len() - hourly_keep;
            self.hourly.drain(..excess);
        }
    }
}

/// Totals across every instance ledger.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageAggregate {
    pub instances: usize,
    pub total_allocations: u64,
    pub total_api_calls: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_response_time_ms: f64,
    pub success_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at_ms: Option<u64>,
}

impl UsageAggregate {
    pub fn from_ledgers(ledgers: &[UsageLedger]) -> Self {
        let mut out = Self {
            instances: ledgers.len(),
            ..Self::default()
        };
        let mut weighted_latency = 0.0;
        let mut weight = 0u64;
        for ledger in ledgers {
            out.total_allocations = out.total_allocations.saturating_add(ledger.total_allocations);
            out.total_api_calls = out.total_api_calls.saturating_add(ledger.total_api_calls);
            out.successful_requests = out
                .successful_requests
                .saturating_add(ledger.successful_requests);
            out.failed_requests = out.failed_requests.saturating_add(ledger.failed_requests);
            out.last_used_at_ms = out.last_used_at_ms.max(ledger.last_used_at_ms);

            weighted_latency += ledger.average_response_time_ms * ledger.total_api_calls as f64;
            weight = weight.saturating_add(ledger.total_api_calls);
        }
        if weight > 0 {
            out.average_response_time_ms = weighted_latency / weight as f64;
        }
        out.success_rate = if out.total_api_calls == 0 {
            100.0
        } else {
            out.successful_requests as f64 * 100.0 / out.total_api_calls as f64
        };
        out
    }
}

pub fn day_start(ts_ms: u64) -> u64 {
    ts_ms - ts_ms % DAY_MS
}

pub fn hour_start(ts_ms: u64) -> u64 {
    ts_ms - ts_ms % HOUR_MS
}

/// `YYYY-MM-DD` in UTC.
pub fn format_day(ts_ms: u64) -> String {
    let seconds = (ts_ms / 1000).min(i64::MAX as u64) as i64;
    OffsetDateTime::from_unix_timestamp(seconds)
        .ok()
        .and_then(|ts| ts.format(format_description!("[year]-[month]-[day]")).ok())
        .unwrap_or_default()
}

fn running_mean(previous: f64, samples: u64, value: f64) -> f64 {
    if samples <= 1 {
        return value;
    }
    let n = samples as f64;
    (previous * (n - 1.0) + value) / n
}
