//! Fixed-schema tuples and their on-page addresses.

use crate::access::value::{DataType, Field};
use crate::storage::error::{DbError, DbResult};
use crate::storage::page::PageId;

/// The schema of a table: an ordered list of field types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleDesc {
    types: Vec<DataType>,
}

impl TupleDesc {
    pub fn new(types: Vec<DataType>) -> Self {
        assert!(!types.is_empty(), "a schema needs at least one field");
        Self { types }
    }

    pub fn types(&self) -> &[DataType] {
        &self.types
    }

    pub fn num_fields(&self) -> usize {
        self.types.len()
    }

    pub fn field_type(&self, index: usize) -> DataType {
        self.types[index]
    }

    /// On-page width of one tuple under this schema.
    pub fn tuple_size(&self) -> usize {
        self.types.iter().map(|t| t.size()).sum()
    }

    /// Checks that a tuple's fields match this schema exactly.
    pub fn validate(&self, tuple: &Tuple) -> DbResult<()> {
        if tuple.fields.len() != self.types.len() {
            return Err(DbError::SchemaMismatch(format!(
                "expected {} fields, got {}",
                self.types.len(),
                tuple.fields.len()
            )));
        }
        for (i, (field, ty)) in tuple.fields.iter().zip(&self.types).enumerate() {
            if field.data_type() != *ty {
                return Err(DbError::SchemaMismatch(format!(
                    "field {} has type {:?}, expected {:?}",
                    i,
                    field.data_type(),
                    ty
                )));
            }
        }
        Ok(())
    }
}

/// Where a stored tuple lives: the owning page plus its slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub pid: PageId,
    pub slot: u16,
}

impl RecordId {
    pub fn new(pid: PageId, slot: u16) -> Self {
        Self { pid, slot }
    }
}

/// A fixed-schema record. Unattached (no RecordId) before insertion.
///
/// Equality compares field contents only; the record id is an address, not
/// part of the value.
#[derive(Debug, Clone)]
pub struct Tuple {
    fields: Vec<Field>,
    rid: Option<RecordId>,
}

impl Tuple {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields, rid: None }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> &Field {
        &self.fields[index]
    }

    pub fn rid(&self) -> Option<RecordId> {
        self.rid
    }

    pub fn set_rid(&mut self, rid: Option<RecordId>) {
        self.rid = rid;
    }

    pub fn serialize_into(&self, desc: &TupleDesc, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), desc.tuple_size());
        let mut offset = 0;
        for (field, ty) in self.fields.iter().zip(desc.types()) {
            field.serialize_into(&mut buf[offset..offset + ty.size()]);
            offset += ty.size();
        }
    }

    pub fn deserialize(desc: &TupleDesc, buf: &[u8]) -> DbResult<Tuple> {
        debug_assert_eq!(buf.len(), desc.tuple_size());
        let mut fields = Vec::with_capacity(desc.num_fields());
        let mut offset = 0;
        for ty in desc.types() {
            fields.push(Field::deserialize(*ty, &buf[offset..offset + ty.size()])?);
            offset += ty.size();
        }
        Ok(Tuple::new(fields))
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl Eq for Tuple {}

impl std::fmt::Display for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{field}")?;
        }
        write!(f, ")")
    }
}
