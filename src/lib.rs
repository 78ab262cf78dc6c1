mod array;
mod bits;
mod cursor;
mod layout;
mod value;

pub use crate::array::{ArrayError, HugeArray, Result, UpdateAction};
pub use crate::bits::{Key, KeyBits};
pub use crate::value::{StoredValue, Value, ValueTag};
