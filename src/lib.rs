pub mod assemble;
pub mod constants;
pub mod error;
pub mod layer;
pub mod logging;
pub mod merge;
pub mod oci;
pub mod pipeline;
pub mod resolve;
pub mod spec;

pub use error::{BakeError, Result};
pub use pipeline::{build, resolve, BuildContext, BuildOutput};
pub use spec::ImageSpec;
