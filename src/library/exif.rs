use std::path::Path;

use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use exif::{In, Tag, Value};

/// Metadata lifted from a photo's EXIF block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExifSummary {
    pub taken_at: Option<DateTime<Utc>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub unique_id: Option<String>,
}

/// Read capture time, GPS position and `ImageUniqueID` from an image file.
///
/// Files without EXIF data yield an empty summary; only failing to open the
/// file is an error.
pub fn read_summary(path: &Path) -> std::io::Result<ExifSummary> {
    let file = std::fs::File::open(path)?;
    let mut bufreader = std::io::BufReader::new(&file);
    let exif_reader = exif::Reader::new();

    let exif_data = match exif_reader.read_from_container(&mut bufreader) {
        Ok(data) => data,
        Err(e) => {
            tracing::debug!("No EXIF data in {}: {}", path.display(), e);
            return Ok(ExifSummary::default());
        }
    };

    let taken_at = exif_data
        .get_field(Tag::DateTimeOriginal, In::PRIMARY)
        .and_then(|f| first_ascii(&f.value))
        .and_then(parse_exif_datetime);

    let latitude = exif_data
        .get_field(Tag::GPSLatitude, In::PRIMARY)
        .and_then(|f| match &f.value {
            Value::Rational(parts) => {
                let reference = exif_data
                    .get_field(Tag::GPSLatitudeRef, In::PRIMARY)
                    .and_then(|r| first_ascii(&r.value));
                dms_to_degrees(parts, reference)
            }
            _ => None,
        });

    let longitude = exif_data
        .get_field(Tag::GPSLongitude, In::PRIMARY)
        .and_then(|f| match &f.value {
            Value::Rational(parts) => {
                let reference = exif_data
                    .get_field(Tag::GPSLongitudeRef, In::PRIMARY)
                    .and_then(|r| first_ascii(&r.value));
                dms_to_degrees(parts, reference)
            }
            _ => None,
        });

    let unique_id = exif_data
        .get_field(Tag::ImageUniqueID, In::PRIMARY)
        .and_then(|f| first_ascii(&f.value))
        .map(|bytes| String::from_utf8_lossy(bytes).trim().to_string())
        .filter(|s| !s.is_empty());

    Ok(ExifSummary {
        taken_at,
        latitude,
        longitude,
        unique_id,
    })
}

fn first_ascii(value: &Value) -> Option<&[u8]> {
    match value {
        Value::Ascii(parts) => parts.first().map(Vec::as_slice),
        _ => None,
    }
}

/// Parse `"YYYY:MM:DD HH:MM:SS"`. EXIF carries no zone, so the device's
/// local zone is assumed.
fn parse_exif_datetime(bytes: &[u8]) -> Option<DateTime<Utc>> {
    let dt = exif::DateTime::from_ascii(bytes).ok()?;
    let naive = NaiveDate::from_ymd_opt(dt.year.into(), dt.month.into(), dt.day.into())?
        .and_hms_opt(dt.hour.into(), dt.minute.into(), dt.second.into())?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

/// Degrees/minutes/seconds to signed decimal degrees. `S` and `W`
/// references are negative.
fn dms_to_degrees(parts: &[exif::Rational], reference: Option<&[u8]>) -> Option<f64> {
    if parts.len() < 3 || parts.iter().any(|p| p.denom == 0) {
        return None;
    }
    let degrees = parts[0].to_f64() + parts[1].to_f64() / 60.0 + parts[2].to_f64() / 3600.0;
    match reference {
        Some(b"S") | Some(b"W") => Some(-degrees),
        _ => Some(degrees),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    fn rational(num: u32, denom: u32) -> exif::Rational {
        exif::Rational { num, denom }
    }

    #[test]
    fn test_dms_to_degrees() {
        let parts = [rational(48, 1), rational(51, 1), rational(2988, 100)];
        let north = dms_to_degrees(&parts, Some(b"N")).unwrap();
        assert!((north - 48.8583).abs() < 1e-3);

        let west = dms_to_degrees(&parts, Some(b"W")).unwrap();
        assert!((west + 48.8583).abs() < 1e-3);
    }

    #[test]
    fn test_dms_rejects_malformed() {
        assert_eq!(dms_to_degrees(&[rational(1, 1)], None), None);
        let zero_denom = [rational(1, 0), rational(0, 1), rational(0, 1)];
        assert_eq!(dms_to_degrees(&zero_denom, None), None);
    }

    #[test]
    fn test_parse_exif_datetime() {
        let parsed = parse_exif_datetime(b"2023:07:14 09:30:05").unwrap();
        let local = parsed.with_timezone(&Local);
        assert_eq!(local.year(), 2023);
        assert_eq!(local.month(), 7);
        assert_eq!(local.day(), 14);
        assert_eq!(local.hour(), 9);
        assert_eq!(local.second(), 5);
        assert!(parse_exif_datetime(b"not a date").is_none());
    }

    #[test]
    fn test_file_without_exif_yields_empty_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();
        assert_eq!(read_summary(&path).unwrap(), ExifSummary::default());
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(read_summary(Path::new("/nonexistent/photo.jpg")).is_err());
    }
}
