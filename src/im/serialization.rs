use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Millis(i64),
    Float(f64),
    Text(String),
}

/// 时间戳反序列化函数（支持 null、毫秒数、RFC 3339 字符串以及 Postgres 文本格式）
pub fn deserialize_opt_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<RawTimestamp> = Deserialize::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(RawTimestamp::Millis(ms)) => DateTime::from_timestamp_millis(ms)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("时间戳超出范围: {}", ms))),
        Some(RawTimestamp::Float(ms)) => DateTime::from_timestamp_millis(ms as i64)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("时间戳超出范围: {}", ms))),
        Some(RawTimestamp::Text(s)) => {
            if s.is_empty() {
                return Ok(None);
            }
            parse_timestamp(&s)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("无法解析时间戳: {}", s)))
        }
    }
}

/// 解析文本时间戳
///
/// 依次尝试 RFC 3339（`2024-05-01T08:00:00.123+00:00`）、
/// Postgres 文本格式（`2024-05-01 08:00:00.123+00`）和不带时区的格式（按 UTC 处理）。
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// 消息 ID 反序列化函数（数据库主键可能是字符串，也可能是整数）
pub fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Int(i64),
        Text(String),
    }

    let raw: Option<RawId> = Deserialize::deserialize(deserializer)?;
    Ok(match raw {
        None => None,
        Some(RawId::Int(i)) => Some(i.to_string()),
        Some(RawId::Text(s)) if s.is_empty() => None,
        Some(RawId::Text(s)) => Some(s),
    })
}

/// 生成消息 ID（客户端侧生成，写入时作为主键）
pub fn generate_msg_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Deserialize)]
    struct Probe {
        #[serde(default, deserialize_with = "deserialize_opt_timestamp")]
        at: Option<DateTime<Utc>>,
        #[serde(default, deserialize_with = "deserialize_opt_id")]
        id: Option<String>,
    }

    #[test]
    fn timestamp_accepts_millis_and_text() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();

        let p: Probe = serde_json::from_str(r#"{"at": 1714550400000}"#).unwrap();
        assert_eq!(p.at, Some(expected));

        let p: Probe = serde_json::from_str(r#"{"at": "2024-05-01T08:00:00+00:00"}"#).unwrap();
        assert_eq!(p.at, Some(expected));

        let p: Probe = serde_json::from_str(r#"{"at": "2024-05-01 08:00:00+00"}"#).unwrap();
        assert_eq!(p.at, Some(expected));

        let p: Probe = serde_json::from_str(r#"{"at": "2024-05-01T08:00:00"}"#).unwrap();
        assert_eq!(p.at, Some(expected));
    }

    #[test]
    fn timestamp_null_or_missing_is_none() {
        let p: Probe = serde_json::from_str(r#"{"at": null}"#).unwrap();
        assert_eq!(p.at, None);
        let p: Probe = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(p.at, None);
    }

    #[test]
    fn timestamp_garbage_is_an_error() {
        assert!(serde_json::from_str::<Probe>(r#"{"at": "yesterday"}"#).is_err());
    }

    #[test]
    fn id_accepts_integer_keys() {
        let p: Probe = serde_json::from_str(r#"{"id": 42}"#).unwrap();
        assert_eq!(p.id.as_deref(), Some("42"));
        let p: Probe = serde_json::from_str(r#"{"id": ""}"#).unwrap();
        assert_eq!(p.id, None);
    }
}
