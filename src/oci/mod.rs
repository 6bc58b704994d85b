//! OCI image model, references, registry access and layout export.

pub mod digest;
pub mod image;
pub mod layout;
pub mod reference;
pub mod registry;

pub use image::{BuiltLayer, ConfigFile, Image, Manifest, Platform};
pub use layout::OciLayoutWriter;
pub use reference::ImageReference;
pub use registry::{Registry, RegistryAuth, RegistryClient};
