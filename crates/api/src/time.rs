//! 管理表单的 not_before 时间解析
//!
//! 接受 `YYYY-MM-DD HH:MM[:SS]` 与 `YYYY-MM-DDTHH:MM[:SS]`：
//! 缺秒补 `:00`，超长截到 19 字符，按本机时区解释。

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};

pub fn parse_not_before(input: &str) -> Result<DateTime<Utc>, String> {
    let mut s = input.trim().replace('T', " ");
    if s.len() == 16 {
        s.push_str(":00");
    }
    if s.len() > 19 {
        s.truncate(19);
    }
    let naive = NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S").map_err(|_| {
        format!("notBefore 格式不正确: {input}（例：2025-09-22 08:00:00 或 2025-09-22T08:00）")
    })?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| format!("notBefore 不是有效的本地时刻: {input}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_datetime() {
        let parsed = parse_not_before("2025-09-22 08:00:00").unwrap();
        let local = parsed.with_timezone(&Local);
        assert_eq!(local.format("%Y-%m-%d %H:%M:%S").to_string(), "2025-09-22 08:00:00");
    }

    #[test]
    fn test_iso_without_seconds_appends_zero() {
        let a = parse_not_before("2025-09-22T08:00").unwrap();
        let b = parse_not_before("2025-09-22 08:00:00").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_overlong_input_truncated_to_19() {
        let a = parse_not_before("2025-09-22 08:00:00.123456789").unwrap();
        let b = parse_not_before("2025-09-22 08:00:00").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(parse_not_before("next tuesday").is_err());
        assert!(parse_not_before("2025-13-99 99:99").is_err());
    }
}
