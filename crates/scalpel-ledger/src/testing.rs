//! Record fixtures shared by the adapter tests

use chrono::{TimeZone, Utc};
use scalpel_core::{DissectionDatabase, DissectionRecord, Fingerprint, HashRecord, Outcome, Value, ValueTree};

pub fn fingerprint(seed: u8) -> Fingerprint {
    Fingerprint::from_bytes([seed; 32])
}

pub fn record(seed: u8) -> DissectionRecord {
    let fields = ValueTree::new(0)
        .with("signature", Value::Unsigned(0xAA55))
        .with("boot_code", Value::Bytes(vec![seed; 4]));
    DissectionRecord {
        fingerprint: fingerprint(seed),
        name: format!("disk{seed}"),
        length: 512,
        outcome: Outcome::Partial,
        dissector: Some("mbr".to_string()),
        fields: Some(fields),
        children: vec![fingerprint(seed.wrapping_add(1))],
        labels: vec!["mbr".to_string()],
        recorded_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        provenance: "scalpel/test".to_string(),
    }
}

/// Behaviour every adapter must share
pub fn exercise_contract(ledger: &dyn DissectionDatabase) {
    let fp = fingerprint(1);
    assert!(ledger.lookup_dissection(&fp).unwrap().is_none());
    assert!(ledger.lookup_hash(&fp).unwrap().is_none());

    let rec = record(1);
    ledger.store(&fp, &rec).unwrap();
    ledger.store(&fp, &rec).unwrap();
    assert_eq!(ledger.lookup_dissection(&fp).unwrap(), Some(rec.clone()));

    let mut newer = rec.clone();
    newer.outcome = Outcome::Ok;
    ledger.store(&fp, &newer).unwrap();
    assert_eq!(ledger.lookup_dissection(&fp).unwrap().unwrap().outcome, Outcome::Ok);

    ledger.store_hash(&HashRecord::new(fp, ["mbr"])).unwrap();
    ledger.store_hash(&HashRecord::new(fp, ["mbr"])).unwrap();
    ledger.store_hash(&HashRecord::new(fp, ["known-good", "mbr"])).unwrap();
    let hash = ledger.lookup_hash(&fp).unwrap().unwrap();
    assert_eq!(hash.labels, vec!["known-good".to_string(), "mbr".to_string()]);
    assert_eq!(hash.fingerprint, fp);
}

/// Record whose fields hold floats JSON cannot express as numbers
pub fn float_record(seed: u8) -> DissectionRecord {
    let mut rec = record(seed);
    rec.fields = Some(
        ValueTree::new(0)
            .with("nan", Value::Float(f64::NAN))
            .with("inf", Value::Float(f64::INFINITY))
            .with("neg_inf", Value::Float(f64::NEG_INFINITY))
            .with("ratio", Value::Float(0.25)),
    );
    rec
}

/// Bit patterns of the float fields of `float_record`
pub fn float_bits(rec: &DissectionRecord) -> Vec<u64> {
    let fields = rec.fields.as_ref().unwrap();
    ["nan", "inf", "neg_inf", "ratio"]
        .iter()
        .map(|name| fields.get(name).and_then(Value::as_f64).unwrap().to_bits())
        .collect()
}
