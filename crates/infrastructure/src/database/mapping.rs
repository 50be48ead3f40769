//! SQLite行中JSON/枚举字段的解析工具

use std::str::FromStr;

use fleet_core::{FleetError, FleetResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub struct MappingHelpers;

impl MappingHelpers {
    /// 解析非空JSON文本列
    pub fn parse_json<T: DeserializeOwned>(row: &SqliteRow, field_name: &str) -> FleetResult<T> {
        let json_str: String = row.try_get(field_name)?;
        serde_json::from_str(&json_str)
            .map_err(|e| FleetError::Serialization(format!("解析字段{field_name}失败: {e}")))
    }

    /// 解析可空JSON文本列
    pub fn parse_optional_json<T: DeserializeOwned>(
        row: &SqliteRow,
        field_name: &str,
    ) -> FleetResult<Option<T>> {
        match row.try_get::<Option<String>, _>(field_name)? {
            Some(json_str) => serde_json::from_str(&json_str)
                .map(Some)
                .map_err(|e| FleetError::Serialization(format!("解析字段{field_name}失败: {e}"))),
            None => Ok(None),
        }
    }

    /// 解析以文本保存的枚举列
    pub fn parse_enum<T>(row: &SqliteRow, field_name: &str) -> FleetResult<T>
    where
        T: FromStr<Err = FleetError>,
    {
        let raw: String = row.try_get(field_name)?;
        raw.parse()
    }

    pub fn to_json<T: Serialize + ?Sized>(value: &T) -> FleetResult<String> {
        Ok(serde_json::to_string(value)?)
    }
}
