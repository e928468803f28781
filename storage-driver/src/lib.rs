//! # Storage driver contract
//!
//! The abstract key/byte-range store that the registry is built on, and the
//! closed error taxonomy every backend reports through.

mod driver;
mod error;

pub use driver::BoxReader;
pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Reader;
pub use error::StorageError;
pub use error::StorageErrorBuilder;
pub use error::StorageErrorKind;
