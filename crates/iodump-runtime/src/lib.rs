pub mod archive;
pub mod collection;
pub mod executor;
pub mod generate;

pub use archive::*;
pub use collection::*;
pub use executor::*;
pub use generate::*;
