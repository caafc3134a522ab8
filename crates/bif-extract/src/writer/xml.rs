//! Markup encoding: one element per record inside a root element

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::io::Write;

use super::RecordEncoder;
use crate::error::{ExtractError, Result};
use crate::record::{Record, Value};

pub struct XmlEncoder {
    root: String,
    record: String,
    children_wrapper: Option<String>,
    child_record: String,
    trailer_count_element: String,
}

impl XmlEncoder {
    pub fn new(
        root: impl Into<String>,
        record: impl Into<String>,
        children_wrapper: Option<String>,
        child_record: impl Into<String>,
        trailer_count_element: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            record: record.into(),
            children_wrapper,
            child_record: child_record.into(),
            trailer_count_element: trailer_count_element.into(),
        }
    }
}

fn xml_err(e: impl std::fmt::Display) -> ExtractError {
    ExtractError::write(format!("xml: {e}"))
}

fn write_fields<W: Write>(writer: &mut Writer<W>, record: &Record) -> Result<()> {
    for field in record.fields() {
        match &field.value {
            Value::Null => writer
                .write_event(Event::Empty(BytesStart::new(field.name.as_str())))
                .map_err(xml_err)?,
            value => {
                let text = value.to_string();
                writer
                    .write_event(Event::Start(BytesStart::new(field.name.as_str())))
                    .map_err(xml_err)?;
                writer
                    .write_event(Event::Text(BytesText::new(&text)))
                    .map_err(xml_err)?;
                writer
                    .write_event(Event::End(BytesEnd::new(field.name.as_str())))
                    .map_err(xml_err)?;
            },
        }
    }
    Ok(())
}

impl RecordEncoder for XmlEncoder {
    fn header(&self, out: &mut dyn Write) -> Result<()> {
        let mut writer = Writer::new(&mut *out);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_err)?;
        out.write_all(b"\n")?;
        let mut writer = Writer::new(&mut *out);
        writer
            .write_event(Event::Start(BytesStart::new(self.root.as_str())))
            .map_err(xml_err)?;
        out.write_all(b"\n")?;
        Ok(())
    }

    fn record(&self, record: &Record, _index: u64, out: &mut dyn Write) -> Result<()> {
        let mut writer = Writer::new(&mut *out);
        writer
            .write_event(Event::Start(BytesStart::new(self.record.as_str())))
            .map_err(xml_err)?;
        write_fields(&mut writer, record)?;

        if !record.children().is_empty() {
            if let Some(wrapper) = &self.children_wrapper {
                writer
                    .write_event(Event::Start(BytesStart::new(wrapper.as_str())))
                    .map_err(xml_err)?;
            }
            for child in record.children() {
                writer
                    .write_event(Event::Start(BytesStart::new(self.child_record.as_str())))
                    .map_err(xml_err)?;
                write_fields(&mut writer, child)?;
                writer
                    .write_event(Event::End(BytesEnd::new(self.child_record.as_str())))
                    .map_err(xml_err)?;
            }
            if let Some(wrapper) = &self.children_wrapper {
                writer
                    .write_event(Event::End(BytesEnd::new(wrapper.as_str())))
                    .map_err(xml_err)?;
            }
        }

        writer
            .write_event(Event::End(BytesEnd::new(self.record.as_str())))
            .map_err(xml_err)?;
        out.write_all(b"\n")?;
        Ok(())
    }

    fn footer(&self, total: u64, out: &mut dyn Write) -> Result<()> {
        let count = total.to_string();
        let mut writer = Writer::new(&mut *out);
        writer
            .write_event(Event::Start(BytesStart::new(
                self.trailer_count_element.as_str(),
            )))
            .map_err(xml_err)?;
        writer
            .write_event(Event::Text(BytesText::new(&count)))
            .map_err(xml_err)?;
        writer
            .write_event(Event::End(BytesEnd::new(self.trailer_count_element.as_str())))
            .map_err(xml_err)?;
        out.write_all(b"\n")?;
        let mut writer = Writer::new(&mut *out);
        writer
            .write_event(Event::End(BytesEnd::new(self.root.as_str())))
            .map_err(xml_err)?;
        out.write_all(b"\n")?;
        Ok(())
    }
}
