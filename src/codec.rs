use crate::error::{HalError, HalResult};
use crate::format::{format_string, FormatCode, Value};
use crate::schema::Schema;
use crate::state::StateSnapshot;
use serde::Serialize;
use std::sync::Arc;

/// One field of the status frame as the firmware headers see it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldLayout {
    pub subsystem: String,
    /// `None` for scalar fields.
    pub unit: Option<usize>,
    pub name: String,
    pub code: FormatCode,
    pub offset: usize,
    pub c_type: &'static str,
}

/// Little-endian status frame codec derived from a [`Schema`].
///
/// Field order is: per subsystem, its scalars in declaration order, then for
/// each unit `0..unit_count` its repeated fields in declaration order.
#[derive(Debug, Clone)]
pub struct Codec {
    schema: Arc<Schema>,
    codes: Vec<FormatCode>,
    frame_len: usize,
}

impl Codec {
    pub fn new(schema: Arc<Schema>) -> Self {
        let mut codes = Vec::with_capacity(schema.field_count());
        for sub in schema.subsystems() {
            codes.extend(sub.scalar_fields.iter().map(|f| f.code));
            for _ in 0..sub.unit_count {
                codes.extend(sub.repeated_fields.iter().map(|f| f.code));
            }
        }
        let frame_len = codes.iter().map(FormatCode::size).sum();

        // NASA Rule 5: frame length must agree with the schema's own sizing
        debug_assert_eq!(frame_len, schema.frame_len());

        Self {
            schema,
            codes,
            frame_len,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    pub fn codes(&self) -> &[FormatCode] {
        &self.codes
    }

    /// Struct-style format string of the whole frame, `<` first.
    pub fn format_string(&self) -> String {
        format!("<{}", format_string(&self.codes))
    }

    pub fn encode(&self, values: &[Value]) -> HalResult<Vec<u8>> {
        if values.len() != self.codes.len() {
            return Err(HalError::Format(format!(
                "frame takes {} values, got {}",
                self.codes.len(),
                values.len()
            )));
        }
        let mut out = Vec::with_capacity(self.frame_len);
        for (code, value) in self.codes.iter().zip(values) {
            code.encode_into(value, &mut out)?;
        }
        Ok(out)
    }

    pub fn decode(&self, bytes: &[u8]) -> HalResult<Vec<Value>> {
        if bytes.len() != self.frame_len {
            return Err(HalError::Format(format!(
                "frame is {} bytes, expected {}",
                bytes.len(),
                self.frame_len
            )));
        }
        let mut values = Vec::with_capacity(self.codes.len());
        let mut offset = 0;
        for code in &self.codes {
            let end = offset + code.size();
            values.push(code.decode(&bytes[offset..end])?);
            offset = end;
        }
        Ok(values)
    }

    pub fn decode_snapshot(&self, bytes: &[u8]) -> HalResult<StateSnapshot> {
        let values = self.decode(bytes)?;
        StateSnapshot::from_values(self.schema.clone(), values)
    }

    pub fn encode_snapshot(&self, snapshot: &StateSnapshot) -> HalResult<Vec<u8>> {
        self.encode(&snapshot.values())
    }

    /// Ordered field list with byte offsets and C type names.
    pub fn layout(&self) -> Vec<FieldLayout> {
        let mut fields = Vec::with_capacity(self.codes.len());
        let mut offset = 0;
        let mut push = |subsystem: &str, unit: Option<usize>, name: &str, code: FormatCode| {
            fields.push(FieldLayout {
                subsystem: subsystem.to_string(),
                unit,
                name: name.to_string(),
                code,
                offset,
                c_type: code.c_type_name(),
            });
            offset += code.size();
        };

        for sub in self.schema.subsystems() {
            for field in &sub.scalar_fields {
                push(&sub.name, None, &field.name, field.code);
            }
            for unit in 0..sub.unit_count {
                for field in &sub.repeated_fields {
                    push(&sub.name, Some(unit), &field.name, field.code);
                }
            }
        }
        fields
    }
}
