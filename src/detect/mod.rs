mod backend;
pub mod backends;
pub mod decode;
mod filter;
mod person;
mod persistence;
pub mod preprocess;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use filter::DetectionFilter;
pub use person::{DetectorStats, PersonConfig, PersonDetector, Presence};
pub use persistence::Persistence;
pub use registry::{load_backend, BackendKind, BackendSpec};
pub use result::{BoundingBox, Detection};
