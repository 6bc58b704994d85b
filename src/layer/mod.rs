//! Layer construction: path cleaning, verified archive fetch and the
//! deterministic tar writer.

pub mod builder;
pub mod fetch;
pub mod path;

pub use builder::{LayerBuilder, LayerStats};
pub use fetch::{CancelFlag, HttpResponse, HttpTransport, ReqwestTransport};
