use std::path::Path;

use chrono::{NaiveDate, NaiveTime};
use dicom::core::Tag;
use dicom::object::{open_file, DefaultDicomObject};

use crate::dicom_access::ElementAccess;
use crate::error::{AnonymizerError, Result};
use crate::models::{RawSubject, ScanFields, Sex};

const PATIENT_NAME: Tag = Tag(0x0010, 0x0010);
const PATIENT_ID: Tag = Tag(0x0010, 0x0020);
const PATIENT_BIRTH_DATE: Tag = Tag(0x0010, 0x0030);
const PATIENT_SEX: Tag = Tag(0x0010, 0x0040);
const PATIENT_SIZE: Tag = Tag(0x0010, 0x1020);
const PATIENT_WEIGHT: Tag = Tag(0x0010, 0x1030);
const PATIENT_ADDRESS: Tag = Tag(0x0010, 0x1040);
const PATIENT_TELEPHONE: Tag = Tag(0x0010, 0x2154);
const SOP_INSTANCE_UID: Tag = Tag(0x0008, 0x0018);
const SERIES_DATE: Tag = Tag(0x0008, 0x0021);
const SERIES_TIME: Tag = Tag(0x0008, 0x0031);
const STUDY_DESCRIPTION: Tag = Tag(0x0008, 0x1030);
const SERIES_DESCRIPTION: Tag = Tag(0x0008, 0x103E);
const SERIES_INSTANCE_UID: Tag = Tag(0x0020, 0x000E);
const SERIES_NUMBER: Tag = Tag(0x0020, 0x0011);
const INSTANCE_NUMBER: Tag = Tag(0x0020, 0x0013);

/// The fields of one DICOM instance that the anonymizer cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub subject: RawSubject,
    pub scan_id: String,
    /// Instance number, or the SOP Instance UID when the number is missing.
    pub instance: String,
    pub scan_fields: ScanFields,
}

impl ParsedRecord {
    pub fn subject_id(&self) -> &str {
        &self.subject.patient_id
    }

    pub fn sex(&self) -> Sex {
        Sex::from_code(self.subject.sex.as_deref())
    }
}

/// Opens `path` and extracts its identifying fields.
pub fn read_record(path: &Path) -> Result<(DefaultDicomObject, ParsedRecord)> {
    let obj = open_file(path).map_err(|e| AnonymizerError::UnreadableRecord {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let record = parse_record(&obj, path)?;
    Ok((obj, record))
}

pub fn parse_record<T: ElementAccess>(obj: &T, path: &Path) -> Result<ParsedRecord> {
    let missing = |field: &'static str| AnonymizerError::MissingRequiredField {
        path: path.to_path_buf(),
        field,
    };

    let patient_id = obj.element_text(PATIENT_ID).ok_or_else(|| missing("Patient ID"))?;
    let scan_id = obj
        .element_text(SERIES_INSTANCE_UID)
        .ok_or_else(|| missing("Series Instance UID"))?;
    let instance = obj
        .element_text(INSTANCE_NUMBER)
        .or_else(|| obj.element_text(SOP_INSTANCE_UID))
        .ok_or_else(|| missing("Instance Number"))?;

    let (last_name, first_name) = obj
        .element_text(PATIENT_NAME)
        .map(|name| split_person_name(&name))
        .unwrap_or_default();

    let subject = RawSubject {
        patient_id,
        first_name,
        last_name,
        sex: obj.element_text(PATIENT_SEX),
        height: obj.element_text(PATIENT_SIZE).and_then(|v| parse_decimal(&v)),
        weight: obj.element_text(PATIENT_WEIGHT).and_then(|v| parse_decimal(&v)),
        birth_date: obj.element_text(PATIENT_BIRTH_DATE).and_then(|v| parse_date(&v)),
        address: obj.element_text(PATIENT_ADDRESS),
        phone_number: obj.element_text(PATIENT_TELEPHONE),
        ..Default::default()
    };

    let scan_fields = ScanFields {
        series_date: obj.element_text(SERIES_DATE).and_then(|v| parse_date(&v)),
        series_number: obj
            .element_text(SERIES_NUMBER)
            .and_then(|v| first_value(&v).parse().ok()),
        series_time: obj.element_text(SERIES_TIME).and_then(|v| parse_time(&v)),
        series_description: obj.element_text(SERIES_DESCRIPTION),
        study_description: obj.element_text(STUDY_DESCRIPTION),
        origin: path.parent().map(Path::to_path_buf),
    };

    Ok(ParsedRecord {
        subject,
        scan_id,
        instance,
        scan_fields,
    })
}

/// Parses a DICOM DA value (`YYYYMMDD`).
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = first_value(value);
    // chrono alone would take "2024011" as January 1st.
    if value.len() != 8 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(value, "%Y%m%d").ok()
}

/// Parses a DICOM TM value (`HH`, `HHMM`, `HHMMSS` or `HHMMSS.ffffff`).
///
/// Anything malformed yields `None`.
pub fn parse_time(value: &str) -> Option<NaiveTime> {
    let value = first_value(value);
    let (clock, fraction) = match value.split_once('.') {
        Some((clock, fraction)) => (clock, Some(fraction)),
        None => (value, None),
    };
    if !clock.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let part = |start: usize| clock.get(start..start + 2).and_then(|s| s.parse::<u32>().ok());
    let (hour, minute, second) = match clock.len() {
        2 => (part(0)?, 0, 0),
        4 => (part(0)?, part(2)?, 0),
        6 => (part(0)?, part(2)?, part(4)?),
        _ => return None,
    };

    let micros = match fraction {
        None => 0,
        Some(f)
            if clock.len() == 6
                && (1..=6).contains(&f.len())
                && f.bytes().all(|b| b.is_ascii_digit()) =>
        {
            format!("{:0<6}", f).parse().ok()?
        }
        Some(_) => return None,
    };

    NaiveTime::from_hms_micro_opt(hour, minute, second, micros)
}

/// Parses a DICOM DS value. `NaN` and infinities are not valid DS.
fn parse_decimal(value: &str) -> Option<f64> {
    first_value(value)
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

fn first_value(value: &str) -> &str {
    value.split('\\').next().unwrap_or_default().trim()
}

/// Splits `Family^Given^...` into (family, given), ignoring ideographic groups.
fn split_person_name(name: &str) -> (Option<String>, Option<String>) {
    let alphabetic = name.split('=').next().unwrap_or_default();
    let mut parts = alphabetic
        .split('^')
        .map(|p| p.trim())
        .map(|p| (!p.is_empty()).then(|| p.to_string()));
    let family = parts.next().flatten();
    let given = parts.next().flatten();
    (family, given)
}
