//! JSON array encoding
//!
//! Records are written as one object per line so the output can be produced
//! incrementally. Decimals are emitted as raw JSON numbers to keep their
//! exact scale.

use std::io::Write;

use super::RecordEncoder;
use crate::error::Result;
use crate::record::{Record, Value};

pub struct JsonArrayEncoder {
    count_field: Option<String>,
    children_name: String,
}

impl JsonArrayEncoder {
    pub fn new(count_field: Option<String>, children_name: Option<String>) -> Self {
        Self {
            count_field,
            children_name: children_name.unwrap_or_else(|| "children".to_string()),
        }
    }

    fn object(&self, record: &Record) -> Result<String> {
        let mut parts = Vec::with_capacity(record.fields().len() + 1);
        for field in record.fields() {
            parts.push(format!(
                "{}:{}",
                serde_json::to_string(&field.name)?,
                json_value(&field.value)?
            ));
        }
        if !record.children().is_empty() {
            let children = record
                .children()
                .iter()
                .map(|c| self.object(c))
                .collect::<Result<Vec<_>>>()?;
            parts.push(format!(
                "{}:[{}]",
                serde_json::to_string(&self.children_name)?,
                children.join(",")
            ));
        }
        Ok(format!("{{{}}}", parts.join(",")))
    }
}

fn json_value(value: &Value) -> Result<String> {
    Ok(match value {
        Value::Null => "null".to_string(),
        Value::Integer(v) => v.to_string(),
        Value::Decimal(d) => d.to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Text(_) | Value::Timestamp(_) => serde_json::to_string(&value.to_string())?,
    })
}

impl RecordEncoder for JsonArrayEncoder {
    fn header(&self, out: &mut dyn Write) -> Result<()> {
        match &self.count_field {
            Some(_) => out.write_all(b"{\"records\":[\n")?,
            None => out.write_all(b"[\n")?,
        }
        Ok(())
    }

    fn record(&self, record: &Record, index: u64, out: &mut dyn Write) -> Result<()> {
        if index > 0 {
            out.write_all(b",\n")?;
        }
        out.write_all(self.object(record)?.as_bytes())?;
        Ok(())
    }

    fn footer(&self, total: u64, out: &mut dyn Write) -> Result<()> {
        match &self.count_field {
            Some(field) => write!(out, "\n],{}:{}}}\n", serde_json::to_string(field)?, total)?,
            None => out.write_all(b"\n]\n")?,
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn render(encoder: &JsonArrayEncoder, records: &[Record]) -> String {
        let mut out = Vec::new();
        encoder.header(&mut out).unwrap();
        for (i, r) in records.iter().enumerate() {
            encoder.record(r, i as u64, &mut out).unwrap();
        }
        encoder.footer(records.len() as u64, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_envelope_is_valid_json() {
        let encoder = JsonArrayEncoder::new(Some("total".to_string()), None);
        let records = vec![
            Record::from_pairs([
                ("id", Value::from(1i64)),
                ("amount", Value::decimal("10.50").unwrap()),
                ("name", Value::from("say \"hi\"")),
            ])
            .unwrap(),
            Record::from_pairs([("id", Value::from(2i64)), ("amount", Value::Null)]).unwrap(),
        ];
        let text = render(&encoder, &records);
        assert!(text.contains("\"amount\":10.50"));

        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["total"], 2);
        assert_eq!(parsed["records"][0]["name"], "say \"hi\"");
        assert!(parsed["records"][1]["amount"].is_null());
    }

    #[test]
    fn test_empty_bare_array() {
        let encoder = JsonArrayEncoder::new(None, None);
        let parsed: serde_json::Value = serde_json::from_str(&render(&encoder, &[])).unwrap();
        assert_eq!(parsed, serde_json::json!([]));
    }

    #[test]
    fn test_children_nested_under_name() {
        let encoder = JsonArrayEncoder::new(None, Some("Lines".to_string()));
        let mut order = Record::from_pairs([("order_id", 1i64)]).unwrap();
        order.push_child(Record::from_pairs([("sku", "A1")]).unwrap());
        let parsed: serde_json::Value =
            serde_json::from_str(&render(&encoder, &[order])).unwrap();
        assert_eq!(parsed[0]["Lines"][0]["sku"], "A1");
    }
}
