//! Converts source row images into sink documents.
//!
//! Decimals are rounded toward zero to a fixed scale and stored as the
//! sink's native high-precision decimal, with a sibling `<name>_str` field
//! carrying the canonical string form. Base documents get `_id` projected
//! from the primary key; version documents always get a fresh id plus
//! bookkeeping fields describing what produced them.

use bigdecimal::BigDecimal;
use bson::oid::ObjectId;
use bson::{Bson, DateTime as BsonDateTime, Decimal128, Document};
use chrono::Utc;

use crate::value::{Row, RowValue};

/// Which mutation produced a version document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Insert,
    Update,
    Delete,
}

impl Op {
    fn as_str(&self) -> &'static str {
        match self {
            Op::Insert => "insert",
            Op::Update => "update",
            Op::Delete => "delete",
        }
    }
}

/// Converts `RowValue` trees into BSON documents, applying the scale-bounded
/// decimal rule and the PK-as-`_id` projection uniformly across base and
/// version documents.
pub struct Converter {
    pk_field: String,
    pk_field_lower: String,
    use_pk_as_mongo_id: bool,
    decimal_scale: i64,
}

impl Converter {
    pub fn new(pk_field: impl Into<String>, use_pk_as_mongo_id: bool) -> Self {
        let pk_field = pk_field.into();
        let pk_field_lower = pk_field.to_lowercase();
        Self {
            pk_field,
            pk_field_lower,
            use_pk_as_mongo_id,
            decimal_scale: 18,
        }
    }

    pub fn with_decimal_scale(mut self, scale: i64) -> Self {
        self.decimal_scale = scale;
        self
    }

    /// Rounds toward zero to `decimal_scale` places; NaN/infinite inputs
    /// (never produced by `BigDecimal`, but mirrored here for parity with
    /// the source's fixed-point handling) come back as `None`.
    fn safe_decimal(&self, v: &BigDecimal) -> Option<BigDecimal> {
        Some(v.with_scale_round(self.decimal_scale, bigdecimal::RoundingMode::Down))
    }

    fn decimal_to_bson(&self, v: &BigDecimal) -> Bson {
        match self.safe_decimal(v) {
            Some(dq) => match dq.to_string().parse::<Decimal128>() {
                Ok(d128) => Bson::Decimal128(d128),
                Err(_) => Bson::Null,
            },
            None => Bson::Null,
        }
    }

    /// Recursively converts one value to its BSON representation. Maps and
    /// lists recurse; everything else maps through directly.
    pub fn convert(&self, value: &RowValue) -> Bson {
        match value {
            RowValue::Null => Bson::Null,
            RowValue::Integer(i) => Bson::Int64(*i),
            RowValue::Float(f) => Bson::Double(*f),
            RowValue::Decimal(d) => self.decimal_to_bson(d),
            RowValue::Date(d) => {
                let dt = d.and_hms_opt(0, 0, 0).expect("midnight is always valid");
                Bson::DateTime(BsonDateTime::from_chrono(dt.and_utc()))
            }
            RowValue::DateTime(dt) => Bson::DateTime(BsonDateTime::from_chrono(*dt)),
            RowValue::String(s) => Bson::String(s.clone()),
            RowValue::Blob(b) => Bson::Binary(bson::Binary {
                subtype: bson::spec::BinarySubtype::Generic,
                bytes: b.clone(),
            }),
            RowValue::Map(row) => Bson::Document(self.convert_row(row)),
            RowValue::List(items) => Bson::Array(items.iter().map(|v| self.convert(v)).collect()),
        }
    }

    fn convert_row(&self, row: &Row) -> Document {
        let mut doc = Document::new();
        for (k, v) in row {
            doc.insert(k.clone(), self.convert(v));
        }
        doc
    }

    /// First row value whose key matches the primary key field, ignoring
    /// case. Matches the source introspector's case-insensitive PK lookup.
    fn find_pk_value<'a>(&self, row: &'a Row) -> Option<(&'a str, &'a RowValue)> {
        row.iter()
            .find(|(k, _)| k.to_lowercase() == self.pk_field_lower)
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Builds the base document: every column converted, decimals getting a
    /// `<name>_str` sibling, and `_id` projected from the PK when enabled.
    pub fn to_base(&self, row: &Row) -> Document {
        let mut doc = Document::new();
        for (k, v) in row {
            doc.insert(k.clone(), self.convert(v));
            if let RowValue::Decimal(d) = v {
                if let Some(dq) = self.safe_decimal(d) {
                    doc.insert(format!("{k}_str"), Bson::String(dq.to_string()));
                }
            }
        }
        if self.use_pk_as_mongo_id {
            if let Some((_, pk_val)) = self.find_pk_value(row) {
                doc.insert("_id", self.convert(pk_val));
            }
        }
        doc
    }

    /// Builds an append-only version document: a fresh `_id`, the PK value
    /// under `pk_field`, a back-reference to the base document, and
    /// bookkeeping fields describing the mutation.
    pub fn to_version(&self, row: &Row, pk_value: &RowValue, base_id: &Bson, op: Op) -> Document {
        let mut doc = self.convert_row(row);
        doc.insert("_id", Bson::ObjectId(ObjectId::new()));
        doc.insert(self.pk_field.clone(), self.convert(pk_value));
        doc.insert("_base_id", base_id.clone());
        doc.insert("_is_version", true);
        doc.insert("_op", op.as_str());
        doc.insert("_ts", Bson::DateTime(BsonDateTime::from_chrono(Utc::now())));
        doc
    }

    /// Extracts the PK value from a row using the same case-insensitive
    /// match `to_base`/`to_version` use, for callers that need it before
    /// building a document (e.g. to compute `base_id`).
    pub fn pk_value<'a>(&self, row: &'a Row) -> Option<&'a RowValue> {
        self.find_pk_value(row).map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::str::FromStr;

    fn row_with(entries: Vec<(&str, RowValue)>) -> Row {
        entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn to_base_projects_pk_case_insensitively() {
        let conv = Converter::new("id", true);
        let row = row_with(vec![
            ("ID".into(), RowValue::Integer(42)),
            ("name".into(), RowValue::String("alice".into())),
        ]);
        let doc = conv.to_base(&row);
        assert_eq!(doc.get("_id"), Some(&Bson::Int64(42)));
        assert_eq!(doc.get_str("name").unwrap(), "alice");
    }

    #[test]
    fn to_base_rounds_decimal_toward_zero_and_adds_str_sibling() {
        let conv = Converter::new("id", false).with_decimal_scale(2);
        let row = row_with(vec![(
            "amount".into(),
            RowValue::Decimal(BigDecimal::from_str("19.9999").unwrap()),
        )]);
        let doc = conv.to_base(&row);
        assert_eq!(doc.get_str("amount_str").unwrap(), "19.99");
    }

    #[test]
    fn to_version_sets_bookkeeping_fields() {
        let conv = Converter::new("id", true);
        let row = row_with(vec![("id".into(), RowValue::Integer(7))]);
        let pk = RowValue::Integer(7);
        let base_id = Bson::Int64(7);
        let doc = conv.to_version(&row, &pk, &base_id, Op::Delete);
        assert_eq!(doc.get_bool("_is_version").unwrap(), true);
        assert_eq!(doc.get_str("_op").unwrap(), "delete");
        assert_eq!(doc.get("_base_id"), Some(&Bson::Int64(7)));
        assert!(doc.get("_id").unwrap().as_object_id().is_some());
    }

    #[test]
    fn convert_recurses_into_nested_maps_and_lists() {
        let conv = Converter::new("id", false);
        let inner = row_with(vec![("x".into(), RowValue::Integer(1))]);
        let value = RowValue::List(vec![RowValue::Map(inner), RowValue::Null]);
        let bson = conv.convert(&value);
        let arr = bson.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[1], Bson::Null);
    }

    #[test]
    fn date_without_time_becomes_midnight_utc() {
        let conv = Converter::new("id", false);
        let d = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let bson = conv.convert(&RowValue::Date(d));
        assert!(matches!(bson, Bson::DateTime(_)));
    }
}
