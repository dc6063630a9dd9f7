pub mod convert;
pub mod file_io;


#[doc(hidden)]
pub use convert::*;
#[doc(hidden)]
pub use file_io::*;
