use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use std::str::FromStr;

use fleet_core::{FleetError, FleetResult};

/// CRON表达式解析和下次执行时间计算
///
/// 接受5段(分 时 日 月 周)和6/7段(带秒)两种写法, 5段表达式会补上秒字段。
#[derive(Debug, Clone)]
pub struct CronExpression {
    schedule: Schedule,
}

impl CronExpression {
    pub fn parse(expr: &str) -> FleetResult<Self> {
        let trimmed = expr.trim();
        let normalized = match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            _ => trimmed.to_string(),
        };
        let schedule = Schedule::from_str(&normalized).map_err(|e| FleetError::InvalidCron {
            expr: expr.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self { schedule })
    }

    /// 严格晚于 `after` 的下一次执行时间
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

/// 固定间隔调度的下次执行时间: anchor + k*N分钟中第一个晚于now的时刻
pub fn next_interval_run(
    anchor: DateTime<Utc>,
    every_minutes: u32,
    now: DateTime<Utc>,
) -> FleetResult<DateTime<Utc>> {
    if every_minutes == 0 {
        return Err(FleetError::InvalidSchedule(
            "间隔分钟数必须大于0".to_string(),
        ));
    }
    if anchor > now {
        return Ok(anchor);
    }

    let minutes = i64::from(every_minutes);
    let period = Duration::minutes(minutes);
    let elapsed_periods = (now - anchor).num_minutes() / minutes;
    let mut next = anchor + Duration::minutes(minutes * elapsed_periods);
    while next <= now {
        next += period;
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_five_field_expression_gets_seconds() {
        let expr = CronExpression::parse("*/15 * * * *").unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 1, 0).unwrap();
        let next = expr.next_after(base).unwrap();
        assert_eq!(next.minute(), 15);
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn test_six_field_expression() {
        let expr = CronExpression::parse("30 0 2 * * *").unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let next = expr.next_after(base).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 2, 2, 0, 30).unwrap());
    }

    #[test]
    fn test_invalid_expression_is_rejected() {
        let err = CronExpression::parse("not a cron").unwrap_err();
        assert_eq!(err.code(), "INVALID_CRON");
        assert!(CronExpression::parse("61 * * * *").is_err());
        assert!(CronExpression::parse("0 9 * * 1-5").is_ok());
    }

    #[test]
    fn test_interval_runs_align_to_anchor() {
        let anchor = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 25, 0).unwrap();
        assert_eq!(
            next_interval_run(anchor, 10, now).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap()
        );

        // 恰好落在周期点上时取下一个周期
        let on_boundary = Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap();
        assert_eq!(
            next_interval_run(anchor, 10, on_boundary).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 40, 0).unwrap()
        );

        let before_anchor = anchor - Duration::hours(1);
        assert_eq!(next_interval_run(anchor, 10, before_anchor).unwrap(), anchor);
        assert!(next_interval_run(anchor, 0, now).is_err());
    }
}
