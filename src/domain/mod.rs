pub mod coverage;
pub mod item;
pub mod price;
pub mod resolution;

pub use coverage::*;
pub use item::*;
pub use price::*;
pub use resolution::*;
