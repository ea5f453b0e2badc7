//! Fixed-width tuples and their descriptors.
//!
//! The store only needs enough tuple machinery to move rows through its
//! insert and delete paths: a descriptor that reports a fixed byte width
//! (the slot stride of a heap page) and values that encode into and decode
//! out of a slot. Richer field semantics live with the query layer.

use std::sync::Arc;

use crate::errors::{Result, StoreError};
use crate::PageId;

/// Content bytes of a text cell; the on-page cell is `4 + TEXT_LEN` bytes.
pub const TEXT_LEN: usize = 128;

/// Slot value of a record id whose tuple has been deleted. The record id
/// keeps pointing at the page the tuple lived on.
pub const SLOT_NONE: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int,
    Text,
}

impl FieldType {
    /// On-page width of a cell of this type.
    pub fn byte_size(&self) -> usize {
        match self {
            FieldType::Int => 4,
            FieldType::Text => 4 + TEXT_LEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Int(i32),
    Text(String),
}

impl Field {
    pub fn field_type(&self) -> FieldType {
        match self {
            Field::Int(_) => FieldType::Int,
            Field::Text(_) => FieldType::Text,
        }
    }

    fn encode(&self, out: &mut [u8]) {
        match self {
            Field::Int(v) => out[..4].copy_from_slice(&v.to_le_bytes()),
            Field::Text(s) => {
                let bytes = s.as_bytes();
                let len = bytes.len().min(TEXT_LEN);
                out[..4].copy_from_slice(&(len as u32).to_le_bytes());
                out[4..4 + len].copy_from_slice(&bytes[..len]);
                out[4 + len..4 + TEXT_LEN].fill(0);
            }
        }
    }

    fn decode(ty: FieldType, bytes: &[u8]) -> Result<Field> {
        match ty {
            FieldType::Int => {
                let v = i32::from_le_bytes(bytes[..4].try_into().unwrap());
                Ok(Field::Int(v))
            }
            FieldType::Text => {
                let len = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
                if len > TEXT_LEN {
                    return Err(StoreError::Schema(format!(
                        "text cell claims {len} bytes, max is {TEXT_LEN}"
                    )));
                }
                let s = std::str::from_utf8(&bytes[4..4 + len])
                    .map_err(|e| StoreError::Schema(format!("text cell is not utf-8: {e}")))?;
                Ok(Field::Text(s.to_string()))
            }
        }
    }
}

/// Ordered field types of a table; every tuple of the table has the same
/// fixed byte width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleDesc {
    types: Vec<FieldType>,
}

impl TupleDesc {
    pub fn new(types: Vec<FieldType>) -> Self {
        Self { types }
    }

    pub fn num_fields(&self) -> usize {
        self.types.len()
    }

    pub fn field_type(&self, i: usize) -> Option<FieldType> {
        self.types.get(i).copied()
    }

    /// Fixed on-page width of one tuple; the slot stride of a heap page.
    pub fn byte_size(&self) -> usize {
        self.types.iter().map(FieldType::byte_size).sum()
    }
}

/// Location of a tuple: its page and slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    desc: Arc<TupleDesc>,
    fields: Vec<Field>,
    record_id: Option<RecordId>,
}

impl Tuple {
    pub fn new(desc: Arc<TupleDesc>, fields: Vec<Field>) -> Result<Self> {
        if fields.len() != desc.num_fields()
            || fields
                .iter()
                .enumerate()
                .any(|(i, f)| desc.field_type(i) != Some(f.field_type()))
        {
            return Err(StoreError::Schema(
                "tuple fields do not match descriptor".to_string(),
            ));
        }
        Ok(Self {
            desc,
            fields,
            record_id: None,
        })
    }

    pub fn desc(&self) -> &Arc<TupleDesc> {
        &self.desc
    }

    pub fn field(&self, i: usize) -> Option<&Field> {
        self.fields.get(i)
    }

    pub fn record_id(&self) -> Option<RecordId> {
        self.record_id
    }

    pub fn set_record_id(&mut self, rid: Option<RecordId>) {
        self.record_id = rid;
    }

    /// Serializes the tuple into one page slot. `out` must be exactly the
    /// descriptor's byte size.
    pub fn encode(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), self.desc.byte_size());
        let mut offset = 0;
        for field in &self.fields {
            let width = field.field_type().byte_size();
            field.encode(&mut out[offset..offset + width]);
            offset += width;
        }
    }

    /// Parses a tuple out of one page slot.
    pub fn decode(desc: Arc<TupleDesc>, bytes: &[u8]) -> Result<Tuple> {
        debug_assert_eq!(bytes.len(), desc.byte_size());
        let mut fields = Vec::with_capacity(desc.num_fields());
        let mut offset = 0;
        for i in 0..desc.num_fields() {
            let ty = desc.field_type(i).unwrap();
            fields.push(Field::decode(ty, &bytes[offset..offset + ty.byte_size()])?);
            offset += ty.byte_size();
        }
        Ok(Tuple {
            desc,
            fields,
            record_id: None,
        })
    }
}
