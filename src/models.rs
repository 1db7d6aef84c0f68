//
// models.rs
// Dicom-Anonymizer-rs
//
// Defines the serializable subject and scan records kept in the association tables.
//
// Thales Matheus Mendonça Santos - November 2025

use std::path::PathBuf;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// Sex hint used when generating a replacement name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sex {
    Male,
    Female,
    #[default]
    Unspecified,
}

impl Sex {
    /// Interprets a DICOM PatientSex code (`M`, `F`, `O`, ...).
    pub fn from_code(code: Option<&str>) -> Self {
        match code.map(|c| c.trim().to_ascii_uppercase()).as_deref() {
            Some("M") => Sex::Male,
            Some("F") => Sex::Female,
            _ => Sex::Unspecified,
        }
    }
}

/// Original demographic fields of a subject, as read from the source files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSubject {
    #[serde(rename = "Patient ID")]
    pub patient_id: String,
    #[serde(rename = "First Name", default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(rename = "Last Name", default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(rename = "Sex", default, skip_serializing_if = "Option::is_none")]
    pub sex: Option<String>,
    #[serde(rename = "Height", default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(rename = "Weight", default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(rename = "Birth Date", default, skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<NaiveDate>,
    #[serde(rename = "Dominant Hand", default, skip_serializing_if = "Option::is_none")]
    pub dominant_hand: Option<String>,
    #[serde(rename = "Email", default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(rename = "Phone Number", default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(rename = "Address", default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl RawSubject {
    pub fn new(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            ..Default::default()
        }
    }

    /// Copies every field that is set on `other` but missing here.
    ///
    /// Fields that already hold a value are never overwritten. Returns `true`
    /// when at least one field was filled in.
    pub fn fill_missing(&mut self, other: &RawSubject) -> bool {
        fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>) -> bool {
            match (slot.is_none(), value) {
                (true, Some(v)) => {
                    *slot = Some(v.clone());
                    true
                }
                _ => false,
            }
        }

        let mut changed = false;
        changed |= fill(&mut self.first_name, &other.first_name);
        changed |= fill(&mut self.last_name, &other.last_name);
        changed |= fill(&mut self.sex, &other.sex);
        changed |= fill(&mut self.height, &other.height);
        changed |= fill(&mut self.weight, &other.weight);
        changed |= fill(&mut self.birth_date, &other.birth_date);
        changed |= fill(&mut self.dominant_hand, &other.dominant_hand);
        changed |= fill(&mut self.email, &other.email);
        changed |= fill(&mut self.phone_number, &other.phone_number);
        changed |= fill(&mut self.address, &other.address);
        changed
    }
}

/// Replacement name assigned to a subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeName {
    pub last_name: String,
    pub first_name: String,
}

impl FakeName {
    /// DICOM person name form, `Last^First`.
    pub fn to_person_name(&self) -> String {
        format!("{}^{}", self.last_name, self.first_name)
    }
}

/// The fake identity that replaces the subject's identifying fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnonymizedIdentity {
    #[serde(rename = "Patient ID")]
    pub patient_id: String,
    #[serde(rename = "First Name")]
    pub first_name: String,
    #[serde(rename = "Last Name")]
    pub last_name: String,
}

impl AnonymizedIdentity {
    pub fn new(patient_id: String, name: FakeName) -> Self {
        Self {
            patient_id,
            first_name: name.first_name,
            last_name: name.last_name,
        }
    }

    pub fn name(&self) -> FakeName {
        FakeName {
            last_name: self.last_name.clone(),
            first_name: self.first_name.clone(),
        }
    }
}

/// One row of the subject table: raw identity plus its assigned fake identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectRecord {
    #[serde(rename = "Raw")]
    pub raw: RawSubject,
    #[serde(rename = "Anonymized")]
    pub anonymized: AnonymizedIdentity,
}

impl SubjectRecord {
    pub fn raw_id(&self) -> &str {
        &self.raw.patient_id
    }

    pub fn fake_id(&self) -> &str {
        &self.anonymized.patient_id
    }
}

/// Descriptive metadata of a series. Never anonymized, only indexed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanFields {
    #[serde(rename = "Series Date", default)]
    pub series_date: Option<NaiveDate>,
    #[serde(rename = "Series Number", default)]
    pub series_number: Option<i64>,
    #[serde(rename = "Series Time", default)]
    pub series_time: Option<NaiveTime>,
    #[serde(rename = "Series Description", default)]
    pub series_description: Option<String>,
    #[serde(rename = "Study Description", default)]
    pub study_description: Option<String>,
    #[serde(rename = "Origin", default)]
    pub origin: Option<PathBuf>,
}

/// One row of the scan table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    #[serde(rename = "Series UID")]
    pub scan_id: String,
    #[serde(rename = "Patient ID")]
    pub subject_raw_id: String,
    #[serde(flatten)]
    pub fields: ScanFields,
}

impl ScanRecord {
    /// Ordering used when the scan table is written out.
    pub fn table_order(
        &self,
    ) -> (&str, Option<NaiveDate>, Option<i64>, &str) {
        (
            &self.subject_raw_id,
            self.fields.series_date,
            self.fields.series_number,
            &self.scan_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sex_codes_are_case_insensitive() {
        assert_eq!(Sex::from_code(Some("m")), Sex::Male);
        assert_eq!(Sex::from_code(Some("F ")), Sex::Female);
        assert_eq!(Sex::from_code(Some("O")), Sex::Unspecified);
        assert_eq!(Sex::from_code(None), Sex::Unspecified);
    }

    #[test]
    fn fill_missing_never_overwrites() {
        let mut stored = RawSubject {
            sex: Some("M".into()),
            ..RawSubject::new("A1")
        };
        let incoming = RawSubject {
            sex: Some("F".into()),
            weight: Some(72.0),
            ..RawSubject::new("A1")
        };

        assert!(stored.fill_missing(&incoming));
        assert_eq!(stored.sex.as_deref(), Some("M"));
        assert_eq!(stored.weight, Some(72.0));
        assert!(!stored.fill_missing(&incoming));
    }

    #[test]
    fn subject_rows_use_namespaced_columns() {
        let record = SubjectRecord {
            raw: RawSubject::new("A1"),
            anonymized: AnonymizedIdentity::new(
                "8KDJ3ZP1".into(),
                FakeName {
                    last_name: "Smith".into(),
                    first_name: "John".into(),
                },
            ),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["Raw"]["Patient ID"], "A1");
        assert_eq!(value["Anonymized"]["Patient ID"], "8KDJ3ZP1");
        assert_eq!(value["Anonymized"]["Last Name"], "Smith");
        assert_eq!(record.anonymized.name().to_person_name(), "Smith^John");
    }
}
