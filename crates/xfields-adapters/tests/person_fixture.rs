use std::path::Path;

use chrono::NaiveDate;
use xfields_adapters::PersonTransformer;
use xfields_core::{ContactId, RawPersonRecord};

fn load_fixture(name: &str) -> RawPersonRecord {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/van")
        .join(name);
    let text = std::fs::read_to_string(&path).expect("read fixture");
    serde_json::from_str(&text).expect("parse fixture")
}

#[test]
fn crm_fixture_transforms_into_enrichment_row() {
    let record = load_fixture("person_full.json");
    let today = NaiveDate::from_ymd_opt(2026, 3, 1).expect("date");

    let row = PersonTransformer::default()
        .transform_fetched(ContactId(101572625), &record, today)
        .expect("row");

    assert_eq!(row.dob.as_deref(), Some("1998-11-23"));
    assert_eq!(
        row.race,
        "Black/African American,Native American/First Nations/Alaska Native"
    );
    assert_eq!(row.gender, "Man");
    assert_eq!(row.custom_value("class"), Some("Class of 2026"));
    // malformed assigned value
    assert_eq!(row.custom_value("hub"), None);
    // not among available values
    assert_eq!(row.custom_value("secondary_hub_role"), None);
    assert_eq!(row.custom_value("other_hub_role"), Some("Trainer"));
    assert_eq!(row.custom_value("hub_role"), None);
    assert_eq!(row.active.as_deref(), Some("false"));
}
