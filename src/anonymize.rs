use dicom::core::value::PrimitiveValue;
use dicom::core::{DataElement, Tag, VR};
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::InMemDicomObject;

use crate::models::AnonymizedIdentity;

/// Replaces the subject's identifying fields with its assigned fake identity.
pub fn apply_identity(
    obj: &mut InMemDicomObject<StandardDataDictionary>,
    identity: &AnonymizedIdentity,
) {
    let person_name = identity.name().to_person_name();
    let replacements = [
        (Tag(0x0010, 0x0010), VR::PN, person_name.as_str()), // PatientName
        (Tag(0x0010, 0x0020), VR::LO, identity.patient_id.as_str()), // PatientID
    ];

    for (tag, vr, val) in replacements {
        obj.put(DataElement::new(tag, vr, PrimitiveValue::from(val)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dicom_access::ElementAccess;

    #[test]
    fn identity_replaces_name_and_id() {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            Tag(0x0010, 0x0010),
            VR::PN,
            PrimitiveValue::from("Real^Person"),
        ));
        obj.put(DataElement::new(
            Tag(0x0010, 0x0040),
            VR::CS,
            PrimitiveValue::from("M"),
        ));

        let identity = AnonymizedIdentity {
            patient_id: "8KDJ3ZP1".into(),
            first_name: "John".into(),
            last_name: "Smith".into(),
        };
        apply_identity(&mut obj, &identity);

        assert_eq!(
            obj.element_text(Tag(0x0010, 0x0010)).as_deref(),
            Some("Smith^John")
        );
        assert_eq!(
            obj.element_text(Tag(0x0010, 0x0020)).as_deref(),
            Some("8KDJ3ZP1")
        );
        // Untouched fields stay as they were.
        assert_eq!(obj.element_text(Tag(0x0010, 0x0040)).as_deref(), Some("M"));
    }
}
