//! Session parameters carried by the START frame.

use crate::error::ProtocolError;
use crate::naming::DATA_INDEX_DIR;
use crate::protocol::PROTOCOL_VERSION;
use crate::wire::{WireReader, WireWriter};
use anyhow::Result;
use chrono::{Datelike, NaiveDate};
use std::path::PathBuf;

/// Retention class of a failover (no history) session.
pub const FAILOVER_RETENTION: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub failover_id: i32,
    /// Remote source identifier; names the directory under the partition.
    pub source: String,
    /// Days of history; 1 means failover mode.
    pub retention: i32,
    pub partition: PathBuf,
    pub compression: bool,
    pub protocol_version: i32,
    /// Group to own every file, or -1 to keep the source group.
    pub quota_gid: i32,
    /// The date the source reports for this pass.
    pub date: NaiveDate,
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidParameter {
        field,
        reason: reason.into(),
    }
}

pub fn validate_source(source: &str) -> Result<(), ProtocolError> {
    if source.is_empty() {
        return Err(invalid("source", "empty"));
    }
    if source.contains('/') || source.contains('\0') {
        return Err(invalid("source", "contains a path separator or NUL"));
    }
    if source.starts_with('.') {
        return Err(invalid("source", "starts with '.'"));
    }
    if source == DATA_INDEX_DIR {
        return Err(invalid("source", "collides with the data index directory"));
    }
    Ok(())
}

fn validate_date(year: i32, month: i32, day: i32) -> Result<NaiveDate, ProtocolError> {
    if !(1970..=9999).contains(&year) {
        return Err(invalid("year", year.to_string()));
    }
    if !(1..=12).contains(&month) {
        return Err(invalid("month", month.to_string()));
    }
    if !(1..=31).contains(&day) {
        return Err(invalid("day", day.to_string()));
    }
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
        .ok_or_else(|| invalid("day", format!("{year}-{month:02}-{day:02} does not exist")))
}

impl SessionParams {
    pub fn is_failover(&self) -> bool {
        self.retention == FAILOVER_RETENTION
    }

    pub fn quota_gid(&self) -> Option<u32> {
        (self.quota_gid != -1).then_some(self.quota_gid as u32)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(payload);
        let failover_id = r.read_compressed_int()?;
        let source = r.read_utf()?;
        let retention = r.read_compressed_int()?;
        let partition = r.read_utf()?;
        let compression = r.read_bool()?;
        let protocol_version = r.read_compressed_int()?;
        let quota_gid = r.read_compressed_int()?;
        let year = r.read_compressed_int()?;
        let month = r.read_compressed_int()?;
        let day = r.read_compressed_int()?;

        validate_source(&source)?;
        if retention < 1 {
            return Err(invalid("retention", retention.to_string()).into());
        }
        if !partition.starts_with('/') {
            return Err(invalid("partition", "not absolute").into());
        }
        if protocol_version != PROTOCOL_VERSION {
            return Err(invalid(
                "protocol_version",
                format!("got {}, supported {}", protocol_version, PROTOCOL_VERSION),
            )
            .into());
        }
        if quota_gid < -1 {
            return Err(invalid("quota_gid", quota_gid.to_string()).into());
        }
        let date = validate_date(year, month, day)?;
        Ok(Self {
            failover_id,
            source,
            retention,
            partition: PathBuf::from(partition),
            compression,
            protocol_version,
            quota_gid,
            date,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = WireWriter::new(Vec::new());
        w.write_compressed_int(self.failover_id)?;
        w.write_utf(&self.source)?;
        w.write_compressed_int(self.retention)?;
        w.write_utf(&self.partition.to_string_lossy())?;
        w.write_bool(self.compression)?;
        w.write_compressed_int(self.protocol_version)?;
        w.write_compressed_int(self.quota_gid)?;
        w.write_compressed_int(self.date.year())?;
        w.write_compressed_int(self.date.month() as i32)?;
        w.write_compressed_int(self.date.day() as i32)?;
        Ok(w.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_protocol_error;

    fn params() -> SessionParams {
        SessionParams {
            failover_id: 17,
            source: "web1.example.com".into(),
            retention: 31,
            partition: PathBuf::from("/var/backup"),
            compression: true,
            protocol_version: PROTOCOL_VERSION,
            quota_gid: -1,
            date: NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(),
        }
    }

    #[test]
    fn test_decode_valid() {
        let p = params();
        let decoded = SessionParams::decode(&p.encode().unwrap()).unwrap();
        assert_eq!(decoded, p);
        assert!(!decoded.is_failover());
        assert_eq!(decoded.quota_gid(), None);
    }

    #[test]
    fn test_reserved_and_bad_sources() {
        for source in ["", "DATA-INDEX", "a/b", ".hidden"] {
            let p = SessionParams {
                source: source.into(),
                ..params()
            };
            let err = SessionParams::decode(&p.encode().unwrap()).unwrap_err();
            assert!(is_protocol_error(&err), "{source}");
        }
    }

    #[test]
    fn test_out_of_range_dates() {
        assert!(validate_date(2023, 2, 29).is_err());
        assert!(validate_date(2024, 13, 1).is_err());
        assert!(validate_date(2024, 0, 1).is_err());
        assert!(validate_date(1969, 12, 31).is_err());
        assert!(validate_date(2024, 4, 31).is_err());
        assert!(validate_date(2024, 4, 30).is_ok());
    }

    #[test]
    fn test_version_and_retention_checked() {
        let p = SessionParams {
            protocol_version: 99,
            ..params()
        };
        assert!(SessionParams::decode(&p.encode().unwrap()).is_err());
        let p = SessionParams {
            retention: 0,
            ..params()
        };
        assert!(SessionParams::decode(&p.encode().unwrap()).is_err());
    }

    #[test]
    fn test_quota_gid_override() {
        let p = SessionParams {
            quota_gid: 500,
            ..params()
        };
        assert_eq!(p.quota_gid(), Some(500));
    }
}
