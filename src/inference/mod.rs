pub mod backend;
pub mod dispatcher;

pub use backend::{ClassifierBackend, ClassifierResult, NoneBackend, SiglipBackend, TritonBackend};
pub use dispatcher::InferenceDispatcher;
