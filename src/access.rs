//! Access methods: typed fields, fixed-schema tuples, and the B+-tree index.

pub mod btree;
pub mod predicate;
pub mod tuple;
pub mod value;

pub use btree::BTreeFile;
pub use predicate::{IndexPredicate, Op};
pub use tuple::{RecordId, Tuple, TupleDesc};
pub use value::{DataType, Field};
